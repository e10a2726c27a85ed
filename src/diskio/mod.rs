pub mod block_io;
pub mod file;
pub mod io_stats;
