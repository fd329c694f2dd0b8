pub mod cursor;

pub use cursor::{ByteCursor, CursorPos, MAX_SEGMENTS};
