//! Background job payloads for the OCR domain.

mod extract_attachment;
mod retry_sweep;

pub use extract_attachment::ExtractAttachmentJob;
pub use retry_sweep::OcrRetrySweepJob;
