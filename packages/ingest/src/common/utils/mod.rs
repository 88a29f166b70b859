pub mod content_hash;

pub use content_hash::message_checksum;
