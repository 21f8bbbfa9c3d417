pub mod addr_range;
pub mod page_bits;
pub mod radix_tree;
pub mod sparse_array;
pub mod summary;
