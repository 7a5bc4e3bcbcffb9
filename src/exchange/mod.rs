//! Generic producer / consumer contracts shared by every backend.
//!
//! The application hands a [`DataSource`] to a backend when it copies or
//! starts a drag, and receives a [`DataOffer`] when another process
//! offers data. Backends translate between these and their native
//! protocol; nothing outside this module needs to know which backend is
//! running.

use std::fmt;
use std::rc::Rc;

use crate::format::{DataFormat, ExchangeData, formats_from_raw, standard_for, unwrap};
use crate::request::AsyncRequest;

/// Producer capability: what can be provided, and the payload for it.
pub trait DataSource {
    /// Formats this source can provide. Fixed for the object's lifetime;
    /// backends query it once.
    fn formats(&self) -> Vec<DataFormat>;

    /// Payload for `format`. Called lazily, only for formats a peer
    /// actually asked for. Returns [`ExchangeData::Empty`] for anything
    /// unsupported or unavailable.
    fn data(&self, format: &DataFormat) -> ExchangeData;
}

/// Consumer capability over data another process offers.
///
/// Once the peer withdraws the offer every request obtained from it
/// still completes, with the failure value.
pub trait DataOffer {
    /// Formats currently offered. Resolves as soon as any answer is known;
    /// formats announced later show up in the next call.
    fn formats(&self) -> AsyncRequest<Vec<DataFormat>>;

    /// Fetch the payload for `format`.
    fn data(&self, format: &DataFormat) -> AsyncRequest<ExchangeData>;

    /// Whether the peer session behind this offer is still alive.
    fn is_valid(&self) -> bool;
}

/// A [`DataSource`] over payloads held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    entries: Vec<(DataFormat, ExchangeData)>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source offering a single text payload.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new().with(DataFormat::text(), ExchangeData::Text(text.into()))
    }

    /// Add a payload. Entries whose variant does not match their format
    /// are ignored.
    pub fn with(mut self, format: DataFormat, data: ExchangeData) -> Self {
        if data.matches_format(&format) {
            self.entries.push((format, data));
        } else {
            tracing::warn!(
                format = %format,
                variant = data.variant_name(),
                "ignoring payload that does not match its format"
            );
        }
        self
    }
}

impl DataSource for MemorySource {
    fn formats(&self) -> Vec<DataFormat> {
        self.entries.iter().map(|(f, _)| f.clone()).collect()
    }

    fn data(&self, format: &DataFormat) -> ExchangeData {
        self.entries
            .iter()
            .find(|(f, _)| f == format)
            .map(|(_, d)| d.clone())
            .unwrap_or_default()
    }
}

/// A source as held by a backend: formats queried once, payloads pulled
/// per request and checked against the format asked for.
pub struct SourceSlot {
    source: Rc<dyn DataSource>,
    formats: Vec<DataFormat>,
}

impl SourceSlot {
    pub fn new(source: Rc<dyn DataSource>) -> Self {
        let formats = source
            .formats()
            .into_iter()
            .filter(DataFormat::is_valid)
            .collect();
        Self { source, formats }
    }

    /// Cached format list.
    pub fn formats(&self) -> &[DataFormat] {
        &self.formats
    }

    /// Every raw name a peer may ask for, primary names first.
    pub fn raw_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for format in &self.formats {
            for name in format.names() {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
        names
    }

    /// The advertised format a peer's raw name refers to.
    pub fn find(&self, raw: &str) -> Option<&DataFormat> {
        self.formats
            .iter()
            .find(|f| f.names().any(|n| n == raw))
            .or_else(|| self.formats.iter().find(|f| f.matches(raw)))
    }

    /// Pull the payload for `format`, exactly once. A mismatched variant
    /// is treated as a failed retrieval.
    pub fn checked_data(&self, format: &DataFormat) -> ExchangeData {
        let data = self.source.data(format);
        if data.is_empty() {
            tracing::debug!(format = %format, "source has no data");
            return ExchangeData::Empty;
        }
        if !data.matches_format(format) {
            tracing::warn!(
                format = %format,
                variant = data.variant_name(),
                "source returned a payload of the wrong kind"
            );
            return ExchangeData::Empty;
        }
        data
    }

    /// Serialized payload for a peer's raw format name.
    pub fn bytes_for(&self, raw: &str) -> Option<Vec<u8>> {
        let format = self.find(raw)?.clone();
        unwrap(&self.checked_data(&format), &format)
    }

    pub fn source(&self) -> &Rc<dyn DataSource> {
        &self.source
    }
}

impl fmt::Debug for SourceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceSlot")
            .field("formats", &self.formats)
            .finish()
    }
}

/// Offer over one of our own sources, returned when the application
/// pastes while it still owns the clipboard. Everything resolves
/// immediately.
pub struct LocalOffer {
    slot: SourceSlot,
}

impl LocalOffer {
    pub fn new(source: Rc<dyn DataSource>) -> Self {
        Self {
            slot: SourceSlot::new(source),
        }
    }
}

impl DataOffer for LocalOffer {
    fn formats(&self) -> AsyncRequest<Vec<DataFormat>> {
        AsyncRequest::ready(self.slot.formats().to_vec())
    }

    fn data(&self, format: &DataFormat) -> AsyncRequest<ExchangeData> {
        match self.slot.formats().iter().find(|f| *f == format) {
            Some(advertised) => AsyncRequest::ready(self.slot.checked_data(advertised)),
            None => AsyncRequest::failed(),
        }
    }

    fn is_valid(&self) -> bool {
        true
    }
}

/// Raw format names a peer has announced so far.
///
/// Platforms announce formats incrementally; a formats request resolves
/// with whatever is known and later announcements are merged in.
#[derive(Debug, Clone, Default)]
pub struct FormatCache {
    raw: Vec<String>,
}

impl FormatCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_raw(raw: impl IntoIterator<Item = String>) -> Self {
        let mut cache = Self::new();
        for name in raw {
            cache.announce(name);
        }
        cache
    }

    /// Record one announced name. Duplicates and empty names are ignored.
    pub fn announce(&mut self, raw: impl Into<String>) {
        let raw = raw.into();
        if !raw.is_empty() && !self.raw.contains(&raw) {
            self.raw.push(raw);
        }
    }

    pub fn raw(&self) -> &[String] {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Announced names as formats, synonyms collapsed.
    pub fn formats(&self) -> Vec<DataFormat> {
        formats_from_raw(self.raw.iter().map(String::as_str))
    }

    /// Whether anything announced so far satisfies `format`.
    pub fn offers(&self, format: &DataFormat) -> bool {
        self.raw.iter().any(|r| standard_for(r) == *format || format.matches(r))
    }
}

// ---------------------------------------------------------------------------
// Drag-and-drop events
// ---------------------------------------------------------------------------

/// Pointer position in the coordinate space of the receiving window
/// (root coordinates on X11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// What a drop does with the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropAction {
    #[default]
    None,
    Copy,
    Move,
    Link,
    Ask,
}

/// Listener answer to an enter / move notification.
#[derive(Debug, Clone, PartialEq)]
pub struct DndReply {
    /// `DropAction::None` rejects the drop at this position.
    pub action: DropAction,
    /// Format the target intends to fetch, if it already knows.
    pub format: Option<DataFormat>,
}

impl DndReply {
    pub fn accept(action: DropAction) -> Self {
        Self {
            action,
            format: None,
        }
    }

    pub fn reject() -> Self {
        Self {
            action: DropAction::None,
            format: None,
        }
    }

    pub fn with_format(mut self, format: DataFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn accepts(&self) -> bool {
        self.action != DropAction::None
    }
}

impl Default for DndReply {
    fn default() -> Self {
        Self::reject()
    }
}

/// Outcome of a drag we started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropOutcome {
    /// Rejected, left, or torn down before the target finished.
    #[default]
    Cancelled,
    /// The target took the drop with this action.
    Completed(DropAction),
}

/// Notifications raised toward the window layer.
pub enum DndEvent {
    Enter {
        position: Position,
        offer: Rc<dyn DataOffer>,
    },
    Move {
        position: Position,
        offer: Rc<dyn DataOffer>,
    },
    Leave {
        offer: Rc<dyn DataOffer>,
    },
    /// Ownership of the offer moves to the handler. Dropping it tells the
    /// backend no more formats will be requested.
    Drop {
        position: Position,
        offer: Box<dyn DataOffer>,
    },
}

impl DndEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DndEvent::Enter { .. } => "enter",
            DndEvent::Move { .. } => "move",
            DndEvent::Leave { .. } => "leave",
            DndEvent::Drop { .. } => "drop",
        }
    }
}

impl fmt::Debug for DndEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DndEvent::Enter { position, .. }
            | DndEvent::Move { position, .. }
            | DndEvent::Drop { position, .. } => f
                .debug_struct(self.kind())
                .field("position", position)
                .finish_non_exhaustive(),
            DndEvent::Leave { .. } => f.debug_struct("leave").finish_non_exhaustive(),
        }
    }
}

/// Receiver of drag-and-drop notifications (the window layer).
pub trait DndListener {
    /// Handle one notification. The reply matters for `Enter`, `Move`
    /// and `Drop` (the action actually performed); it is ignored for
    /// `Leave`.
    fn dnd_event(&mut self, event: DndEvent) -> DndReply;
}

/// Listener that rejects everything. Installed until the window layer
/// provides one.
#[derive(Debug, Default)]
pub struct RejectAll;

impl DndListener for RejectAll {
    fn dnd_event(&mut self, _event: DndEvent) -> DndReply {
        DndReply::reject()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ImageBuffer;

    struct Mismatched;

    impl DataSource for Mismatched {
        fn formats(&self) -> Vec<DataFormat> {
            vec![DataFormat::text()]
        }

        fn data(&self, _format: &DataFormat) -> ExchangeData {
            ExchangeData::Image(ImageBuffer::new(0, 0, Vec::new()).unwrap())
        }
    }

    #[test]
    fn unadvertised_format_is_empty() {
        let source = MemorySource::text("hello");
        assert_eq!(source.data(&DataFormat::uri_list()), ExchangeData::Empty);
        assert_eq!(
            source.data(&DataFormat::text()),
            ExchangeData::Text("hello".into())
        );
    }

    #[test]
    fn memory_source_skips_mismatched_entries() {
        let source = MemorySource::new().with(DataFormat::uri_list(), ExchangeData::Text("x".into()));
        assert!(source.formats().is_empty());
    }

    #[test]
    fn slot_turns_mismatch_into_empty() {
        let slot = SourceSlot::new(Rc::new(Mismatched));
        assert!(slot.checked_data(&DataFormat::text()).is_empty());
        assert_eq!(slot.bytes_for("UTF8_STRING"), None);
    }

    #[test]
    fn slot_resolves_raw_names() {
        let slot = SourceSlot::new(Rc::new(MemorySource::text("hi")));
        assert_eq!(slot.find("STRING"), Some(&DataFormat::text()));
        assert_eq!(slot.find("text/plain;charset=UTF-8"), Some(&DataFormat::text()));
        assert!(slot.find("image/png").is_none());
        assert_eq!(slot.bytes_for("UTF8_STRING").unwrap(), b"hi");
        assert_eq!(
            slot.raw_names(),
            vec![
                "text/plain;charset=utf-8",
                "text/plain",
                "UTF8_STRING",
                "STRING",
                "TEXT"
            ]
        );
    }

    #[test]
    fn slot_queries_formats_once() {
        use std::cell::Cell;

        struct Counting(Rc<Cell<u32>>);
        impl DataSource for Counting {
            fn formats(&self) -> Vec<DataFormat> {
                self.0.set(self.0.get() + 1);
                vec![DataFormat::text()]
            }
            fn data(&self, _format: &DataFormat) -> ExchangeData {
                ExchangeData::Text("x".into())
            }
        }

        let calls = Rc::new(Cell::new(0));
        let slot = SourceSlot::new(Rc::new(Counting(calls.clone())));
        slot.formats();
        slot.bytes_for("TEXT");
        slot.raw_names();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn format_cache_merges_late_announcements() {
        let mut cache = FormatCache::new();
        cache.announce("text/plain");
        assert_eq!(cache.formats(), vec![DataFormat::text()]);
        cache.announce("text/uri-list");
        cache.announce("text/plain");
        assert_eq!(
            cache.formats(),
            vec![DataFormat::text(), DataFormat::uri_list()]
        );
        assert!(cache.offers(&DataFormat::uri_list()));
        assert!(!cache.offers(&DataFormat::image()));
    }

    #[test]
    fn local_offer_resolves_immediately() {
        let offer = LocalOffer::new(Rc::new(MemorySource::text("mine")));
        assert_eq!(
            offer.formats().try_take(),
            Ok(Some(vec![DataFormat::text()]))
        );
        assert_eq!(
            offer.data(&DataFormat::text()).try_take(),
            Ok(Some(ExchangeData::Text("mine".into())))
        );
        assert_eq!(
            offer.data(&DataFormat::uri_list()).try_take(),
            Ok(Some(ExchangeData::Empty))
        );
    }

    #[test]
    fn reply_helpers() {
        assert!(DndReply::accept(DropAction::Copy).accepts());
        assert!(!DndReply::reject().accepts());
        assert_eq!(DropOutcome::default(), DropOutcome::Cancelled);
    }
}
