pub mod reader;
pub mod record;

pub use reader::BinlogReader;
pub use record::{BasicHeader, Record, StoreRecord};
