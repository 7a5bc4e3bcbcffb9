//! [`ComOffer`]: a [`DataOffer`] over someone else's `IDataObject`.
//!
//! `GetData` is synchronous, so every request resolves before it is
//! returned.

use std::cell::Cell;
use std::rc::Rc;

use super::convert::decode;
use super::data_object::ComDataObject;
use super::object::ComObject;
use super::types::{DATADIR_GET, FormatEtc, FormatRegistry, HResult, StgMedium};
use crate::exchange::DataOffer;
use crate::format::{DataFormat, ExchangeData};
use crate::request::AsyncRequest;

pub struct ComOffer {
    object: ComObject<dyn ComDataObject>,
    registry: Rc<FormatRegistry>,
    valid: Rc<Cell<bool>>,
}

impl ComOffer {
    pub fn new(object: ComObject<dyn ComDataObject>, registry: Rc<FormatRegistry>) -> Self {
        Self::with_validity(object, registry, Rc::new(Cell::new(true)))
    }

    /// Offer whose validity the caller controls through `valid`.
    pub fn with_validity(
        object: ComObject<dyn ComDataObject>,
        registry: Rc<FormatRegistry>,
        valid: Rc<Cell<bool>>,
    ) -> Self {
        Self {
            object,
            registry,
            valid,
        }
    }

    pub fn object(&self) -> &ComObject<dyn ComDataObject> {
        &self.object
    }

    fn offered(&self) -> Vec<FormatEtc> {
        match self.object.enum_format_etc(DATADIR_GET) {
            Ok(list) => list.collect_remaining(),
            Err(hr) => {
                tracing::debug!(%hr, "EnumFormatEtc failed");
                Vec::new()
            }
        }
    }

    /// Generic formats on offer, in the object's order.
    pub fn format_list(&self) -> Vec<DataFormat> {
        let mut out: Vec<DataFormat> = Vec::new();
        for etc in self.offered() {
            if let Some(format) = self.registry.format_of(etc.cf_format)
                && !out.contains(&format)
            {
                out.push(format);
            }
        }
        out
    }

    fn fetch(&self, format: &DataFormat) -> ExchangeData {
        for cf in self.registry.clip_formats(format) {
            let etc = FormatEtc::hglobal(cf);
            if self.object.query_get_data(&etc) != HResult::S_OK {
                continue;
            }
            match self.object.get_data(&etc) {
                Ok(StgMedium::HGlobal(bytes)) => {
                    let data = decode(&bytes, format, cf);
                    if !data.is_empty() {
                        return data;
                    }
                    tracing::debug!(cf, format = %format, "undecodable clipboard data");
                }
                Ok(StgMedium::Null) => {}
                Err(hr) => tracing::debug!(cf, format = %format, %hr, "GetData failed"),
            }
        }
        ExchangeData::Empty
    }
}

impl DataOffer for ComOffer {
    fn formats(&self) -> AsyncRequest<Vec<DataFormat>> {
        if !self.is_valid() {
            return AsyncRequest::failed();
        }
        AsyncRequest::ready(self.format_list())
    }

    fn data(&self, format: &DataFormat) -> AsyncRequest<ExchangeData> {
        if !self.is_valid() || !format.is_valid() {
            return AsyncRequest::failed();
        }
        AsyncRequest::ready(self.fetch(format))
    }

    fn is_valid(&self) -> bool {
        self.valid.get()
    }
}
