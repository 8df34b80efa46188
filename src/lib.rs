pub mod buf_pool;
pub mod buf_pool_vec;
pub mod checksum;
pub mod config;
pub mod filter;
pub mod loopback;
pub mod mmap_area;
pub mod ping;
#[cfg(feature = "libbpf")]
pub mod program;
pub mod proto;
pub mod ring;
pub mod socket;
pub mod umem;
pub mod util;
pub mod xdp;
