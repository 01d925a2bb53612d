mod assert;
mod idset;

pub use idset::IdSet;
