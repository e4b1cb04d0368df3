pub mod buffer;
pub mod reader;
pub mod writer;

pub use buffer::{shared_buffer, SharedBuffer, SourceDestBuffer};
pub use reader::CompressedVectorReader;
pub use writer::CompressedVectorWriter;
