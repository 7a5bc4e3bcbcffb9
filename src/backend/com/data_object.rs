//! `IDataObject` and the producer side: [`DataObject`] serves a
//! [`DataSource`] to OLE consumers.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::convert::encode;
use super::object::{ComObject, Unknown};
use super::types::{
    DATADIR_GET, FormatEtc, FormatRegistry, Guid, HResult, IID_IDATAOBJECT, IID_IENUMFORMATETC,
    StgMedium,
};
use crate::exchange::{DataSource, SourceSlot};
use crate::format::DataFormat;

/// `IDataObject`. The advise methods have default bodies: we never
/// support change notifications.
pub trait ComDataObject: Unknown {
    fn get_data(&self, format: &FormatEtc) -> Result<StgMedium, HResult>;

    fn query_get_data(&self, format: &FormatEtc) -> HResult;

    fn enum_format_etc(&self, direction: u32) -> Result<ComObject<EnumFormatEtc>, HResult>;

    /// `release` mirrors `fRelease`: whether the object takes the medium.
    /// Mediums are owned values here, so it only matters for logging.
    fn set_data(&self, format: &FormatEtc, medium: StgMedium, release: bool) -> HResult;

    fn d_advise(&self, _format: &FormatEtc, _flags: u32) -> Result<u32, HResult> {
        Err(HResult::OLE_E_ADVISENOTSUPPORTED)
    }

    fn d_unadvise(&self, _connection: u32) -> HResult {
        HResult::OLE_E_ADVISENOTSUPPORTED
    }

    fn enum_d_advise(&self) -> HResult {
        HResult::OLE_E_ADVISENOTSUPPORTED
    }
}

/// `IEnumFORMATETC` over a snapshot of the formats.
#[derive(Debug)]
pub struct EnumFormatEtc {
    formats: Rc<[FormatEtc]>,
    cursor: Cell<usize>,
}

impl EnumFormatEtc {
    pub fn new(formats: Vec<FormatEtc>) -> Self {
        Self {
            formats: formats.into(),
            cursor: Cell::new(0),
        }
    }

    /// Up to `count` entries; `S_FALSE` when fewer were left.
    pub fn next(&self, count: usize) -> (Vec<FormatEtc>, HResult) {
        let start = self.cursor.get().min(self.formats.len());
        let end = start.saturating_add(count).min(self.formats.len());
        self.cursor.set(end);
        let taken = self.formats[start..end].to_vec();
        let hr = if taken.len() == count {
            HResult::S_OK
        } else {
            HResult::S_FALSE
        };
        (taken, hr)
    }

    pub fn skip(&self, count: usize) -> HResult {
        let target = self.cursor.get().saturating_add(count);
        self.cursor.set(target.min(self.formats.len()));
        if target <= self.formats.len() {
            HResult::S_OK
        } else {
            HResult::S_FALSE
        }
    }

    pub fn reset(&self) -> HResult {
        self.cursor.set(0);
        HResult::S_OK
    }

    /// `Clone`: an independent enumerator at the same position.
    pub fn clone_enum(&self) -> ComObject<EnumFormatEtc> {
        ComObject::new(Self {
            formats: Rc::clone(&self.formats),
            cursor: Cell::new(self.cursor.get()),
        })
    }

    /// Everything from the current position on.
    pub fn collect_remaining(&self) -> Vec<FormatEtc> {
        self.next(usize::MAX).0
    }
}

impl Unknown for EnumFormatEtc {
    fn interfaces(&self) -> &'static [Guid] {
        &[IID_IENUMFORMATETC]
    }
}

/// Producer data object over a [`DataSource`].
///
/// Every format of the source is offered under each clipboard id it
/// converts to; `SetData` adds further (id, bytes) pairs, which the shell
/// uses for hints such as the preferred drop effect.
pub struct DataObject {
    slot: SourceSlot,
    registry: Rc<FormatRegistry>,
    stored: RefCell<Vec<(FormatEtc, Vec<u8>)>>,
}

impl DataObject {
    pub fn new(source: Rc<dyn DataSource>, registry: Rc<FormatRegistry>) -> Self {
        Self {
            slot: SourceSlot::new(source),
            registry,
            stored: RefCell::new(Vec::new()),
        }
    }

    pub fn source(&self) -> &Rc<dyn DataSource> {
        self.slot.source()
    }

    /// Offered `FORMATETC`s, converted formats first.
    pub fn format_etcs(&self) -> Vec<FormatEtc> {
        let mut out: Vec<FormatEtc> = Vec::new();
        for format in self.slot.formats() {
            for cf in self.registry.clip_formats(format) {
                let etc = FormatEtc::hglobal(cf);
                if !out.contains(&etc) {
                    out.push(etc);
                }
            }
        }
        for (etc, _) in self.stored.borrow().iter() {
            if !out.iter().any(|o| o.cf_format == etc.cf_format) {
                out.push(*etc);
            }
        }
        out
    }

    /// The advertised format behind a clipboard id.
    fn format_for(&self, etc: &FormatEtc) -> Option<&DataFormat> {
        self.slot
            .formats()
            .iter()
            .find(|format| self.registry.clip_formats(format).contains(&etc.cf_format))
    }

    fn stored_bytes(&self, etc: &FormatEtc) -> Option<Vec<u8>> {
        self.stored
            .borrow()
            .iter()
            .find(|(stored, _)| stored.cf_format == etc.cf_format)
            .map(|(_, bytes)| bytes.clone())
    }
}

impl Unknown for DataObject {
    fn interfaces(&self) -> &'static [Guid] {
        &[IID_IDATAOBJECT]
    }
}

impl ComDataObject for DataObject {
    fn get_data(&self, format: &FormatEtc) -> Result<StgMedium, HResult> {
        format.check()?;
        if let Some(bytes) = self.stored_bytes(format) {
            return Ok(StgMedium::HGlobal(bytes));
        }
        let Some(data_format) = self.format_for(format) else {
            return Err(HResult::DV_E_FORMATETC);
        };
        let data = self.slot.checked_data(data_format);
        match encode(&data, data_format, format.cf_format) {
            Some(bytes) => Ok(StgMedium::HGlobal(bytes)),
            None => {
                tracing::debug!(
                    cf = format.cf_format,
                    format = %data_format,
                    "source has no data for requested format"
                );
                Err(HResult::DV_E_FORMATETC)
            }
        }
    }

    fn query_get_data(&self, format: &FormatEtc) -> HResult {
        if let Err(hr) = format.check() {
            return hr;
        }
        if self.stored_bytes(format).is_some() || self.format_for(format).is_some() {
            HResult::S_OK
        } else {
            HResult::DV_E_FORMATETC
        }
    }

    fn enum_format_etc(&self, direction: u32) -> Result<ComObject<EnumFormatEtc>, HResult> {
        if direction != DATADIR_GET {
            return Err(HResult::E_NOTIMPL);
        }
        Ok(ComObject::new(EnumFormatEtc::new(self.format_etcs())))
    }

    fn set_data(&self, format: &FormatEtc, medium: StgMedium, release: bool) -> HResult {
        if let Err(hr) = format.check() {
            return hr;
        }
        let StgMedium::HGlobal(bytes) = medium else {
            return HResult::E_INVALIDARG;
        };
        tracing::trace!(cf = format.cf_format, len = bytes.len(), release, "data object stored format");
        let mut stored = self.stored.borrow_mut();
        match stored.iter_mut().find(|(etc, _)| etc.cf_format == format.cf_format) {
            Some(entry) => entry.1 = bytes,
            None => stored.push((*format, bytes)),
        }
        HResult::S_OK
    }
}
