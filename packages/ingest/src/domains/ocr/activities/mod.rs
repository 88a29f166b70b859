pub mod extract;
pub mod retry_sweep;

pub use extract::extract_attachment;
pub use retry_sweep::sweep_ocr_retries;
