/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Lowest file descriptor handed out by open(); 0-2 are the standard streams.
pub const FIRSTFD: usize = 3;

/// Page size in bytes.
pub const PGSIZE: usize = 4096;

/// Page cache hash width.
pub const NBUCKET: usize = 256;

/// Page cache capacity in pages.
pub const MAXPAGES: usize = 1024;

/// Buffer cache hash width.
pub const NBIOBUCKET: usize = 16;

/// Size of the disk block cache, in buffers.
pub const NBUF: usize = 64;

/// Default sector size; individual devices may override.
pub const SECTOR_SIZE: usize = 512;

/// Maximum file path name.
pub const MAXPATH: usize = 256;

/// Maximum length of one path component (an LFN may carry up to 255
/// units, but the resolver caps components here).
pub const MAXNAME: usize = 255;

/// Kernel stack size in pages, per process.
pub const KSTACKPAGES: usize = 4;

/// User stack reservation in pages, just below the kernel split.
pub const USTACKPAGES: usize = 4;

/// Scheduler priority levels. Level 0 is the most urgent; the idle task
/// lives alone on the last level.
pub const NPRIO: usize = 8;

/// Ticks in one time slice, per priority level (level 0 first).
pub const TIME_SLICE: [u32; NPRIO] = [2, 4, 6, 8, 10, 12, 14, 16];

/// Ready ticks without running before a task gets a one-level boost.
pub const STARVATION_TICKS: u32 = 100;

/// Number of signals; handler slots per process.
pub const NSIG: usize = 32;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Read-ahead window slots shared by all file handles.
pub const NRAWINDOW: usize = 4;

/// Bytes per read-ahead window.
pub const RAWINDOW_SIZE: usize = 8192;

/// Driver reads at least this long populate a read-ahead window.
pub const RATHRESHOLD: usize = 512;

/// Kernel bounce buffer for chunking user read/write transfers.
pub const BOUNCE_SIZE: usize = PGSIZE;

/// Base of the kernel half of the address space; user addresses are
/// strictly below this.
pub const KERNBASE: usize = 0xC000_0000;

/// Load address for user program images.
pub const USER_CODE_BASE: usize = 0x0040_0000;

/// Top of the user stack, immediately below the kernel split.
pub const USTACKTOP: usize = KERNBASE;

/// Device number of the file system root disk.
pub const ROOTDEV: u32 = 1;

/// PIDs below this are never handed out again after wraparound.
pub const PID_RESERVED: i32 = 16;
