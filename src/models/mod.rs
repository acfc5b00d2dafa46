pub mod selection;

pub use selection::{SelectionKind, TEXT_MIME_TYPES, pick_text_mime, read_capped};
