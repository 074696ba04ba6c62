//! Companion crate to [`memprof`].  This crate compiles into a dynamic library that can be
//! loaded via `LD_PRELOAD` to intercept `malloc`, `calloc`, `realloc`, `free` and the aligned
//! allocation functions issued by the program and report them to the `memprof` tracker.
//!
//! Environment:
//!
//! * `MEMPROF_STREAM`: when set, stream to `MEMPROF_HOST`:`MEMPROF_PORT`
//!   (default `127.0.0.1:7777`) every `MEMPROF_INTERVAL_MS` (default 200).
//! * `MEMPROF_LOG`: `tracing` filter for diagnostics on stderr, e.g. `memprof=debug`.

use std::cell::UnsafeCell;
use std::env;
use std::mem;
use std::process;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use libc::{c_char, c_int, c_void, dlsym, size_t, RTLD_NEXT};
use memprof::hook::{record_alloc, record_free, record_realloc_alloc, record_realloc_free};
use memprof::{ReentryGuard, Transport, TransportConfig};
use once_cell::sync::{Lazy, OnceCell};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type MallocFunc = unsafe extern "C" fn(size: size_t) -> *mut c_void;
type FreeFunc = unsafe extern "C" fn(ptr: *mut c_void);
type ReallocFunc = unsafe extern "C" fn(ptr: *mut c_void, size: size_t) -> *mut c_void;
type PosixMemalignFunc =
    unsafe extern "C" fn(memptr: *mut *mut c_void, alignment: size_t, size: size_t) -> c_int;

struct RealFuncs {
    malloc: MallocFunc,
    free: FreeFunc,
    realloc: ReallocFunc,
    posix_memalign: PosixMemalignFunc,
}

unsafe fn resolve(name: &[u8]) -> *mut c_void {
    let sym = dlsym(RTLD_NEXT, name.as_ptr() as *const c_char);
    if sym.is_null() {
        panic!("memprof: couldn't find original {}", String::from_utf8_lossy(name));
    }
    sym
}

// Set while `dlsym` runs; allocations made by the dynamic loader in that
// window are served from `BOOTSTRAP`.
static RESOLVING: AtomicBool = AtomicBool::new(false);

static REAL: Lazy<RealFuncs> = Lazy::new(|| unsafe {
    RESOLVING.store(true, Ordering::SeqCst);
    let funcs = RealFuncs {
        malloc: mem::transmute::<*mut c_void, MallocFunc>(resolve(b"malloc\0")),
        free: mem::transmute::<*mut c_void, FreeFunc>(resolve(b"free\0")),
        realloc: mem::transmute::<*mut c_void, ReallocFunc>(resolve(b"realloc\0")),
        posix_memalign: mem::transmute::<*mut c_void, PosixMemalignFunc>(resolve(
            b"posix_memalign\0",
        )),
    };
    RESOLVING.store(false, Ordering::SeqCst);
    funcs
});

const BOOTSTRAP_SIZE: usize = 16 * 1024;
const BOOTSTRAP_ALIGN: usize = 16;

#[repr(C, align(16))]
struct Bootstrap {
    buf: UnsafeCell<[u8; BOOTSTRAP_SIZE]>,
    used: AtomicUsize,
}

// SAFETY: disjoint ranges of `buf` are handed out through the atomic `used`
// counter; nothing reads or writes the buffer through the struct itself.
unsafe impl Sync for Bootstrap {}

static BOOTSTRAP: Bootstrap = Bootstrap::new();

impl Bootstrap {
    const fn new() -> Self {
        Bootstrap {
            buf: UnsafeCell::new([0; BOOTSTRAP_SIZE]),
            used: AtomicUsize::new(0),
        }
    }

    fn alloc(&self, size: usize) -> *mut c_void {
        let size = match size.checked_add(BOOTSTRAP_ALIGN - 1) {
            Some(padded) => padded & !(BOOTSTRAP_ALIGN - 1),
            None => return ptr::null_mut(),
        };
        let start = self.used.fetch_add(size, Ordering::SeqCst);
        if start >= BOOTSTRAP_SIZE || size > BOOTSTRAP_SIZE - start {
            return ptr::null_mut();
        }
        // SAFETY: `start + size` is within the buffer and the range is ours alone.
        unsafe { (self.buf.get() as *mut u8).add(start) as *mut c_void }
    }

    fn owns(&self, ptr: *mut c_void) -> bool {
        let base = self.buf.get() as usize;
        let p = ptr as usize;
        p >= base && p < base + BOOTSTRAP_SIZE
    }

    // Bytes between `ptr` and the end of the buffer.
    fn remaining_from(&self, ptr: *mut c_void) -> usize {
        self.buf.get() as usize + BOOTSTRAP_SIZE - ptr as usize
    }
}

unsafe fn set_errno(code: c_int) {
    *libc::__errno_location() = code;
}

unsafe fn set_enomem() {
    set_errno(libc::ENOMEM);
}

// Serves a loader-time allocation, failing like `malloc` when the arena is spent.
unsafe fn from_bootstrap(arena: &Bootstrap, size: usize) -> *mut c_void {
    let ptr = arena.alloc(size.max(1));
    if ptr.is_null() {
        set_enomem();
    }
    ptr
}

/// When this library is loaded with `LD_PRELOAD`, this `malloc` implementation
/// catches `malloc` calls performed by the program and records them in the `memprof`
/// tracker after invoking the original `libc` malloc.
///
/// # Safety
///
/// This method internally uses the `libc` malloc, which is `unsafe extern "C"`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    if RESOLVING.load(Ordering::SeqCst) {
        return from_bootstrap(&BOOTSTRAP, size);
    }
    let size = size.max(1);
    let ptr = (REAL.malloc)(size);
    if ptr.is_null() {
        set_enomem();
        return ptr;
    }
    record_alloc(ptr as *mut u8, size, false);
    ptr
}

/// # Safety
///
/// `ptr` must be null or a pointer returned by this library's allocation functions.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() || BOOTSTRAP.owns(ptr) {
        return;
    }
    record_free(ptr as *mut u8);
    (REAL.free)(ptr);
}

/// # Safety
///
/// See [`malloc`].
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    let total = match nmemb.checked_mul(size) {
        Some(total) => total,
        None => {
            set_enomem();
            return ptr::null_mut();
        }
    };
    if RESOLVING.load(Ordering::SeqCst) {
        // The bootstrap buffer is static and never reused, so it is zeroed.
        return from_bootstrap(&BOOTSTRAP, total);
    }
    let ptr = malloc(total);
    if !ptr.is_null() {
        ptr::write_bytes(ptr as *mut u8, 0, total.max(1));
    }
    ptr
}

/// # Safety
///
/// `ptr` must be null or a pointer returned by this library's allocation functions.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    if ptr.is_null() {
        return malloc(size);
    }
    if size == 0 {
        free(ptr);
        return ptr::null_mut();
    }
    if BOOTSTRAP.owns(ptr) {
        let new_ptr = malloc(size);
        if !new_ptr.is_null() {
            let len = size.min(BOOTSTRAP.remaining_from(ptr));
            ptr::copy_nonoverlapping(ptr as *const u8, new_ptr as *mut u8, len);
        }
        return new_ptr;
    }

    let old_size = libc::malloc_usable_size(ptr);
    // Retire the old address before libc can hand it to another thread.
    let carried = record_realloc_free(ptr as *mut u8);
    let new_ptr = (REAL.realloc)(ptr, size);
    if new_ptr.is_null() {
        // The old block is untouched and still belongs to the caller.
        record_realloc_alloc(ptr as *mut u8, old_size, carried);
        set_enomem();
        return new_ptr;
    }
    record_realloc_alloc(new_ptr as *mut u8, size, carried);
    new_ptr
}

/// # Safety
///
/// `memptr` must be valid for writing a pointer.
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    if RESOLVING.load(Ordering::SeqCst) {
        if alignment > BOOTSTRAP_ALIGN {
            return libc::ENOMEM;
        }
        let ptr = BOOTSTRAP.alloc(size.max(1));
        if ptr.is_null() {
            return libc::ENOMEM;
        }
        *memptr = ptr;
        return 0;
    }
    let size = size.max(1);
    let mut ptr = ptr::null_mut();
    let rc = (REAL.posix_memalign)(&mut ptr, alignment, size);
    if rc != 0 {
        return rc;
    }
    record_alloc(ptr as *mut u8, size, false);
    *memptr = ptr;
    0
}

// `posix_memalign` with the errno convention of the other aligned allocators.
unsafe fn aligned(alignment: usize, size: usize) -> *mut c_void {
    let mut ptr = ptr::null_mut();
    match posix_memalign(&mut ptr, alignment, size) {
        0 => ptr,
        rc => {
            set_errno(rc);
            ptr::null_mut()
        }
    }
}

fn page_size() -> usize {
    // SAFETY: `sysconf` has no preconditions.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

/// # Safety
///
/// See [`malloc`].
#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
    if !alignment.is_power_of_two() {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    }
    aligned(alignment.max(mem::size_of::<*mut c_void>()), size)
}

/// # Safety
///
/// See [`malloc`].
#[no_mangle]
pub unsafe extern "C" fn memalign(alignment: size_t, size: size_t) -> *mut c_void {
    // Like glibc, round odd alignments up instead of rejecting them.
    let alignment = match alignment
        .max(mem::size_of::<*mut c_void>())
        .checked_next_power_of_two()
    {
        Some(alignment) => alignment,
        None => {
            set_errno(libc::EINVAL);
            return ptr::null_mut();
        }
    };
    aligned(alignment, size)
}

/// # Safety
///
/// See [`malloc`].
#[no_mangle]
pub unsafe extern "C" fn valloc(size: size_t) -> *mut c_void {
    aligned(page_size(), size)
}

/// # Safety
///
/// See [`malloc`].
#[no_mangle]
pub unsafe extern "C" fn pvalloc(size: size_t) -> *mut c_void {
    let page = page_size();
    match size.max(1).checked_add(page - 1) {
        Some(padded) => aligned(page, padded & !(page - 1)),
        None => {
            set_enomem();
            ptr::null_mut()
        }
    }
}

static TRANSPORT: OnceCell<Transport> = OnceCell::new();

// Process that started `TRANSPORT`; forked children skip the shutdown.
static OWNER_PID: AtomicU32 = AtomicU32::new(0);

extern "C" fn init() {
    // Bootstrap allocations belong to the profiler.
    let _guard = ReentryGuard::new();

    if let Ok(filter) = env::var("MEMPROF_LOG") {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_writer(std::io::stderr)
            .try_init();
    }

    memprof::install_tracker();

    // SAFETY: the handlers are plain `extern "C" fn()`s, and `prepare` always
    // runs before the matching `parent`/`child`.
    if unsafe { libc::pthread_atfork(Some(fork_prepare), Some(fork_parent), Some(fork_child)) }
        != 0
    {
        warn!("memprof: pthread_atfork failed; forked children may deadlock");
    }

    if env::var_os("MEMPROF_STREAM").is_none() {
        return;
    }
    match TransportConfig::from_env() {
        Ok(config) => start_streaming(config),
        Err(e) => warn!("memprof: not streaming: {}", e),
    }
}

fn start_streaming(config: TransportConfig) {
    info!("memprof: streaming to {}:{}", config.host, config.port);
    OWNER_PID.store(process::id(), Ordering::SeqCst);
    let transport = TRANSPORT.get_or_init(|| Transport::new(config));
    transport.start_configured();

    // SAFETY: `shutdown` is a plain `extern "C" fn()` with no preconditions.
    unsafe {
        libc::atexit(shutdown);
    }
}

extern "C" fn shutdown() {
    // `atexit` handlers are inherited by forked children, the worker thread is not.
    if OWNER_PID.load(Ordering::SeqCst) != process::id() {
        return;
    }
    let _guard = ReentryGuard::new();
    if let Some(transport) = TRANSPORT.get() {
        transport.stop();
    }
}

unsafe extern "C" fn fork_prepare() {
    memprof::fork::prepare();
}

unsafe extern "C" fn fork_parent() {
    memprof::fork::parent();
}

unsafe extern "C" fn fork_child() {
    memprof::fork::child();
}

// Runs `init` when the dynamic loader maps this library.
#[cfg(target_os = "linux")]
#[used]
#[link_section = ".init_array"]
static INITIALIZE: extern "C" fn() = init;

#[cfg(test)]
mod tests {
    use super::*;
    use memprof::{AllocationRecord, MemoryTracker};
    use std::hint::black_box;
    use std::net::TcpListener;

    fn errno() -> c_int {
        unsafe { *libc::__errno_location() }
    }

    fn clear_errno() {
        unsafe { set_errno(0) };
    }

    fn live(ptr: *mut c_void) -> Option<AllocationRecord> {
        MemoryTracker::global()
            .snapshot_live()
            .into_iter()
            .find(|r| r.address == ptr as usize)
    }

    #[test]
    fn malloc_zero_returns_a_block() {
        unsafe {
            let p = black_box(malloc(black_box(0)));
            assert!(!p.is_null());
            free(p);
        }
    }

    #[test]
    fn failed_malloc_sets_enomem() {
        clear_errno();
        let p = unsafe { black_box(malloc(black_box(usize::MAX - 4096))) };
        assert!(p.is_null());
        assert_eq!(errno(), libc::ENOMEM);
    }

    #[test]
    fn free_null_is_a_noop() {
        unsafe { free(ptr::null_mut()) };
    }

    #[test]
    fn calloc_zeroes_and_rejects_overflow() {
        unsafe {
            let p = black_box(calloc(16, 8)) as *mut u8;
            assert!(!p.is_null());
            assert!(std::slice::from_raw_parts(p, 128).iter().all(|b| *b == 0));
            free(p as *mut c_void);

            clear_errno();
            let q = black_box(calloc(black_box(usize::MAX), 2));
            assert!(q.is_null());
            assert_eq!(errno(), libc::ENOMEM);
        }
    }

    #[test]
    fn realloc_null_and_zero() {
        unsafe {
            let p = black_box(realloc(ptr::null_mut(), 32)) as *mut u8;
            assert!(!p.is_null());
            p.write_bytes(0xab, 32);
            let q = black_box(realloc(p as *mut c_void, 0));
            assert!(q.is_null());
        }
    }

    #[test]
    fn tracks_blocks_through_realloc() {
        memprof::install_tracker();
        unsafe {
            memprof::set_callsite("buffer.c", 7);
            let p = black_box(malloc(24));
            let rec = live(p).expect("malloc is tracked");
            assert_eq!(rec.size, 24);
            assert_eq!(rec.file, Some("buffer.c"));

            let q = black_box(realloc(p, 4000));
            assert!(!q.is_null());
            let rec = live(q).expect("realloc is tracked");
            assert_eq!(rec.size, 4000);
            assert_eq!(rec.file, Some("buffer.c"));
            assert_eq!(rec.line, 7);
            free(q);
        }
    }

    #[test]
    fn aligned_allocators_are_tracked() {
        memprof::install_tracker();
        unsafe {
            let mut p = ptr::null_mut();
            assert_eq!(posix_memalign(&mut p, 64, 100), 0);
            assert_eq!(p as usize % 64, 0);
            assert_eq!(live(p).map(|r| r.size), Some(100));
            free(p);

            let mut untouched = ptr::null_mut();
            assert_eq!(posix_memalign(&mut untouched, 3, 8), libc::EINVAL);
            assert!(untouched.is_null());

            let a = black_box(aligned_alloc(128, 256));
            assert_eq!(a as usize % 128, 0);
            assert_eq!(live(a).map(|r| r.size), Some(256));
            free(a);

            clear_errno();
            assert!(black_box(aligned_alloc(48, 96)).is_null());
            assert_eq!(errno(), libc::EINVAL);

            let m = black_box(memalign(32, 10));
            assert_eq!(m as usize % 32, 0);
            assert!(live(m).is_some());
            free(m);

            let v = black_box(valloc(10));
            assert_eq!(v as usize % page_size(), 0);
            free(v);

            let pv = black_box(pvalloc(10));
            assert_eq!(pv as usize % page_size(), 0);
            assert_eq!(live(pv).map(|r| r.size), Some(page_size()));
            free(pv);
        }
    }

    #[test]
    fn spent_bootstrap_fails_with_enomem() {
        let arena = Box::new(Bootstrap::new());
        unsafe {
            let p = from_bootstrap(&arena, 100);
            assert!(arena.owns(p));
            assert_eq!(p as usize % BOOTSTRAP_ALIGN, 0);

            clear_errno();
            assert!(from_bootstrap(&arena, BOOTSTRAP_SIZE).is_null());
            assert_eq!(errno(), libc::ENOMEM);
        }
    }

    #[test]
    fn bootstrap_blocks_never_reach_libc_free() {
        unsafe {
            let p = BOOTSTRAP.alloc(32) as *mut u8;
            assert!(!p.is_null());
            p.write_bytes(7, 32);
            // Would abort inside libc if forwarded.
            free(p as *mut c_void);

            let q = black_box(realloc(p as *mut c_void, 64)) as *mut u8;
            assert!(!q.is_null());
            assert!(!BOOTSTRAP.owns(q as *mut c_void));
            assert!(std::slice::from_raw_parts(q, 32).iter().all(|b| *b == 7));
            free(q as *mut c_void);
        }
    }

    #[test]
    fn forked_child_exits_cleanly_while_streaming() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        start_streaming(TransportConfig::new("127.0.0.1", port));
        let _conn = listener.accept().unwrap();

        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            let outcome = std::panic::catch_unwind(|| unsafe {
                let p = malloc(64);
                assert!(!p.is_null());
                free(p);
                let transport = TRANSPORT.get().unwrap();
                transport.stop();
                assert!(!transport.is_running());
            });
            // `exit` runs the inherited `atexit(shutdown)`.
            unsafe { libc::exit(if outcome.is_ok() { 0 } else { 1 }) };
        }

        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        assert!(libc::WIFEXITED(status), "child status {:#x}", status);
        assert_eq!(libc::WEXITSTATUS(status), 0);

        let transport = TRANSPORT.get().unwrap();
        assert!(transport.is_running());
        transport.stop();
    }
}
