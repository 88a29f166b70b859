pub mod ocr;
pub mod sync;
