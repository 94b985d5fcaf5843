use anyhow::anyhow;
use std::any::Any;

/// Turn a caught panic payload into an error the acknowledgment path can
/// record. Panics raised via `panic!` carry a `&str` or `String` payload;
/// anything else is reported without detail.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("processor panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("processor panicked: {message}")
    } else {
        anyhow!("processor panicked")
    }
}
