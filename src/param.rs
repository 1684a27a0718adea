/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Device number of the file system root disk.
pub const ROOTDEV: u32 = 1;

/// Block size.
pub const BSIZE: usize = 1024;

/// Size of the disk block cache.
pub const NBUF: usize = 30;

/// Number of hash buckets in the disk block cache.
/// A small prime keeps consecutive block numbers in distinct buckets.
pub const NBUCKET: usize = 13;

/// Maximum length of a process name.
pub const MAXPROCNAME: usize = 16;
