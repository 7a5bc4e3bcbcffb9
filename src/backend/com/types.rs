//! OLE value types: `HRESULT` codes, `FORMATETC`, `STGMEDIUM`, drop
//! effects, key-state bits, interface ids and the clipboard format table.

use std::cell::RefCell;
use std::fmt;

use crate::exchange::DropAction;
use crate::format::{DataFormat, FormatKind, standard_for};

/// `CLIPFORMAT`.
pub type ClipFormat = u16;

pub const CF_TEXT: ClipFormat = 1;
pub const CF_DIB: ClipFormat = 8;
pub const CF_UNICODETEXT: ClipFormat = 13;
pub const CF_HDROP: ClipFormat = 15;

/// First id `RegisterClipboardFormat` hands out.
pub const CF_REGISTERED_FIRST: ClipFormat = 0xC000;

pub const DVASPECT_CONTENT: u32 = 1;
pub const TYMED_HGLOBAL: u32 = 1;
pub const DATADIR_GET: u32 = 1;
pub const DATADIR_SET: u32 = 2;

// Key-state bits passed to IDropTarget / IDropSource.
pub const MK_LBUTTON: u32 = 0x0001;
pub const MK_RBUTTON: u32 = 0x0002;
pub const MK_SHIFT: u32 = 0x0004;
pub const MK_CONTROL: u32 = 0x0008;
pub const MK_MBUTTON: u32 = 0x0010;
pub const MK_ALT: u32 = 0x0020;

/// A COM `HRESULT`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HResult(pub i32);

impl HResult {
    pub const S_OK: HResult = HResult(0);
    pub const S_FALSE: HResult = HResult(1);
    pub const DATA_S_SAMEFORMATETC: HResult = HResult(0x0004_0130);
    pub const DRAGDROP_S_DROP: HResult = HResult(0x0004_0100);
    pub const DRAGDROP_S_CANCEL: HResult = HResult(0x0004_0101);
    pub const DRAGDROP_S_USEDEFAULTCURSORS: HResult = HResult(0x0004_0102);
    pub const E_NOTIMPL: HResult = HResult(0x8000_4001_u32 as i32);
    pub const E_NOINTERFACE: HResult = HResult(0x8000_4002_u32 as i32);
    pub const E_POINTER: HResult = HResult(0x8000_4003_u32 as i32);
    pub const E_FAIL: HResult = HResult(0x8000_4005_u32 as i32);
    pub const E_UNEXPECTED: HResult = HResult(0x8000_FFFF_u32 as i32);
    pub const E_OUTOFMEMORY: HResult = HResult(0x8007_000E_u32 as i32);
    pub const E_INVALIDARG: HResult = HResult(0x8007_0057_u32 as i32);
    pub const OLE_E_ADVISENOTSUPPORTED: HResult = HResult(0x8004_0003_u32 as i32);
    pub const DV_E_FORMATETC: HResult = HResult(0x8004_0064_u32 as i32);
    pub const DV_E_LINDEX: HResult = HResult(0x8004_0068_u32 as i32);
    pub const DV_E_TYMED: HResult = HResult(0x8004_0069_u32 as i32);
    pub const DV_E_DVASPECT: HResult = HResult(0x8004_006B_u32 as i32);

    pub fn is_ok(self) -> bool {
        self.0 >= 0
    }

    pub fn is_err(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Debug for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HResult({:#010x})", self.0 as u32)
    }
}

impl fmt::Display for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0 as u32)
    }
}

/// `FORMATETC` without a target device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatEtc {
    pub cf_format: ClipFormat,
    pub aspect: u32,
    pub lindex: i32,
    pub tymed: u32,
}

impl FormatEtc {
    /// Whole-content, HGLOBAL-backed: the only kind we produce or read.
    pub fn hglobal(cf_format: ClipFormat) -> Self {
        Self {
            cf_format,
            aspect: DVASPECT_CONTENT,
            lindex: -1,
            tymed: TYMED_HGLOBAL,
        }
    }

    /// Reject anything but content / HGLOBAL / whole-object requests.
    pub fn check(&self) -> Result<(), HResult> {
        if self.aspect != DVASPECT_CONTENT {
            return Err(HResult::DV_E_DVASPECT);
        }
        if self.tymed & TYMED_HGLOBAL == 0 {
            return Err(HResult::DV_E_TYMED);
        }
        if self.lindex != -1 {
            return Err(HResult::DV_E_LINDEX);
        }
        Ok(())
    }
}

/// `STGMEDIUM`, reduced to the memory-backed case. The HGLOBAL contents
/// are owned bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StgMedium {
    #[default]
    Null,
    HGlobal(Vec<u8>),
}

/// `DROPEFFECT` bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct DropEffect(pub u32);

impl DropEffect {
    pub const NONE: DropEffect = DropEffect(0);
    pub const COPY: DropEffect = DropEffect(1);
    pub const MOVE: DropEffect = DropEffect(2);
    pub const LINK: DropEffect = DropEffect(4);
    pub const SCROLL: DropEffect = DropEffect(0x8000_0000);

    pub fn contains(self, other: DropEffect) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// The single effect this set names, preferring copy. Scroll is
    /// ignored.
    pub fn to_action(self) -> DropAction {
        if self.contains(Self::COPY) {
            DropAction::Copy
        } else if self.contains(Self::MOVE) {
            DropAction::Move
        } else if self.contains(Self::LINK) {
            DropAction::Link
        } else {
            DropAction::None
        }
    }

    /// "Ask" has no OLE counterpart and maps to copy.
    pub fn from_action(action: DropAction) -> DropEffect {
        match action {
            DropAction::None => Self::NONE,
            DropAction::Copy | DropAction::Ask => Self::COPY,
            DropAction::Move => Self::MOVE,
            DropAction::Link => Self::LINK,
        }
    }
}

impl std::ops::BitOr for DropEffect {
    type Output = DropEffect;

    fn bitor(self, rhs: DropEffect) -> DropEffect {
        DropEffect(self.0 | rhs.0)
    }
}

impl fmt::Debug for DropEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (bit, name) in [(Self::COPY, "copy"), (Self::MOVE, "move"), (Self::LINK, "link")] {
            if self.contains(bit) {
                names.push(name);
            }
        }
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// A COM interface id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }
}

/// Suffix shared by the OLE interface ids.
const OLE_SUFFIX: [u8; 8] = [0xC0, 0, 0, 0, 0, 0, 0, 0x46];

pub const IID_IUNKNOWN: Guid = Guid::new(0x0000_0000, 0, 0, OLE_SUFFIX);
pub const IID_IDATAOBJECT: Guid = Guid::new(0x0000_010E, 0, 0, OLE_SUFFIX);
pub const IID_IENUMFORMATETC: Guid = Guid::new(0x0000_0103, 0, 0, OLE_SUFFIX);
pub const IID_IDROPSOURCE: Guid = Guid::new(0x0000_0121, 0, 0, OLE_SUFFIX);
pub const IID_IDROPTARGET: Guid = Guid::new(0x0000_0122, 0, 0, OLE_SUFFIX);

/// The clipboard format table: the predefined ids we convert, plus the
/// names registered at run time (`RegisterClipboardFormat`).
#[derive(Debug, Default)]
pub struct FormatRegistry {
    registered: RefCell<Vec<String>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `name`, registering it on first use. Registering the same
    /// name again returns the same id.
    pub fn register(&self, name: &str) -> ClipFormat {
        let mut registered = self.registered.borrow_mut();
        let index = match registered.iter().position(|n| n == name) {
            Some(index) => index,
            None => {
                registered.push(name.to_string());
                registered.len() - 1
            }
        };
        CF_REGISTERED_FIRST.saturating_add(index as ClipFormat)
    }

    /// Name of a registered id.
    pub fn name(&self, id: ClipFormat) -> Option<String> {
        let index = id.checked_sub(CF_REGISTERED_FIRST)? as usize;
        self.registered.borrow().get(index).cloned()
    }

    /// Clipboard formats for `format`, most preferred first.
    pub fn clip_formats(&self, format: &DataFormat) -> Vec<ClipFormat> {
        match format.kind() {
            FormatKind::Text => vec![CF_UNICODETEXT, CF_TEXT],
            FormatKind::UriList => vec![CF_HDROP],
            FormatKind::Image => vec![CF_DIB],
            FormatKind::Bytes => vec![self.register(format.name())],
        }
    }

    /// The generic format a clipboard id carries, if we know it.
    pub fn format_of(&self, id: ClipFormat) -> Option<DataFormat> {
        match id {
            CF_TEXT | CF_UNICODETEXT => Some(DataFormat::text()),
            CF_HDROP => Some(DataFormat::uri_list()),
            CF_DIB => Some(DataFormat::image()),
            _ => self.name(id).map(|name| standard_for(&name)),
        }
    }
}
