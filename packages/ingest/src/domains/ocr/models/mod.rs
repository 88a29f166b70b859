pub mod ocr_result;

pub use ocr_result::{OcrResult, OcrStatus, DEFAULT_CONFIDENCE};
