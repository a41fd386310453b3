pub mod ask;
pub mod collections;
pub mod index;
pub mod status;
