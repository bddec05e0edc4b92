mod indexed;
mod readwrite;
mod writeonly;

pub use indexed::{generate_index, IndexedReader};
pub use readwrite::ReadWrite;
pub use writeonly::WriteOnly;
