/// Simulated WASI (preview1) Process
///
/// **Responsibility:**
/// Give a compiled module the smallest process environment it needs to run:
/// one argument (`prog.wasm`), no environment variables, no pre-opened
/// directories, stdin fed from a byte buffer, stdout/stderr captured into
/// byte buffers.
///
/// Nothing here touches the real filesystem or spawns a process. Every run
/// owns its own `SimulatedProcess`, so shards running side by side never
/// share buffers.

use wasmi::core::Trap;
use wasmi::{Caller, Extern, Linker, Memory};

pub const WASI_MODULE: &str = "wasi_snapshot_preview1";
pub const PROGRAM_NAME: &str = "prog.wasm";

const ERRNO_SUCCESS: i32 = 0;
const ERRNO_BADF: i32 = 8;
const ERRNO_FAULT: i32 = 21;
const ERRNO_SPIPE: i32 = 70;

const FILETYPE_CHARACTER_DEVICE: u8 = 2;

/// Host-side state of one simulated process.
#[derive(Debug, Default)]
pub struct SimulatedProcess {
    args: Vec<String>,
    stdin: Vec<u8>,
    stdin_pos: usize,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Set by `proc_exit`
    pub exit_code: Option<i32>,
}

impl SimulatedProcess {
    pub fn new(stdin: &str) -> Self {
        Self {
            args: vec![PROGRAM_NAME.to_string()],
            stdin: stdin.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    /// Append to stdout (fd 1) or stderr (fd 2). Returns the byte count, or
    /// `None` for any other descriptor.
    pub fn write(&mut self, fd: u32, bytes: &[u8]) -> Option<usize> {
        match fd {
            1 => self.stdout.extend_from_slice(bytes),
            2 => self.stderr.extend_from_slice(bytes),
            _ => return None,
        }
        Some(bytes.len())
    }

    /// Copy pending stdin into `buf`. Returns 0 once stdin is drained, or
    /// `None` for descriptors other than 0.
    pub fn read(&mut self, fd: u32, buf: &mut [u8]) -> Option<usize> {
        if fd != 0 {
            return None;
        }
        let pending = &self.stdin[self.stdin_pos..];
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        self.stdin_pos += n;
        Some(n)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// NUL-terminated argument strings, as laid out by `args_get`.
    fn arg_bytes(&self) -> Vec<Vec<u8>> {
        self.args
            .iter()
            .map(|a| {
                let mut bytes = a.as_bytes().to_vec();
                bytes.push(0);
                bytes
            })
            .collect()
    }
}

/// Anything that can hand out the simulated process living in a store.
pub trait HasProcess {
    fn process(&self) -> &SimulatedProcess;
    fn process_mut(&mut self) -> &mut SimulatedProcess;
}

/// Register the preview1 imports on `linker`.
pub fn add_to_linker<T: HasProcess + 'static>(linker: &mut Linker<T>) -> anyhow::Result<()> {
    linker.func_wrap(WASI_MODULE, "fd_write", fd_write::<T>)?;
    linker.func_wrap(WASI_MODULE, "fd_read", fd_read::<T>)?;
    linker.func_wrap(
        WASI_MODULE,
        "proc_exit",
        |mut caller: Caller<'_, T>, code: i32| -> Result<(), Trap> {
            caller.data_mut().process_mut().exit_code = Some(code);
            Err(Trap::i32_exit(code))
        },
    )?;
    linker.func_wrap(WASI_MODULE, "args_sizes_get", args_sizes_get::<T>)?;
    linker.func_wrap(WASI_MODULE, "args_get", args_get::<T>)?;
    linker.func_wrap(
        WASI_MODULE,
        "environ_sizes_get",
        |mut caller: Caller<'_, T>, count_ptr: i32, size_ptr: i32| -> i32 {
            errno(write_u32_pair(&mut caller, count_ptr, 0, size_ptr, 0))
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "environ_get",
        |_: Caller<'_, T>, _environ: i32, _buf: i32| -> i32 { ERRNO_SUCCESS },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_close",
        |_: Caller<'_, T>, _fd: i32| -> i32 { ERRNO_SUCCESS },
    )?;
    linker.func_wrap(WASI_MODULE, "fd_fdstat_get", fd_fdstat_get::<T>)?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_seek",
        |_: Caller<'_, T>, _fd: i32, _offset: i64, _whence: i32, _newoffset: i32| -> i32 {
            ERRNO_SPIPE
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_prestat_get",
        |_: Caller<'_, T>, _fd: i32, _buf: i32| -> i32 { ERRNO_BADF },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_prestat_dir_name",
        |_: Caller<'_, T>, _fd: i32, _path: i32, _len: i32| -> i32 { ERRNO_BADF },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "clock_time_get",
        |mut caller: Caller<'_, T>, _id: i32, _precision: i64, time_ptr: i32| -> i32 {
            errno(write_guest(&mut caller, time_ptr, &0u64.to_le_bytes()))
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "random_get",
        |mut caller: Caller<'_, T>, buf: i32, len: i32| -> i32 {
            let Some(memory) = exported_memory(&caller) else {
                return ERRNO_FAULT;
            };
            if len as u32 as usize > memory.data(&caller).len() {
                return ERRNO_FAULT;
            }
            let zeros = vec![0u8; len as u32 as usize];
            errno(write_guest(&mut caller, buf, &zeros))
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "sched_yield",
        |_: Caller<'_, T>| -> i32 { ERRNO_SUCCESS },
    )?;
    Ok(())
}

fn fd_write<T: HasProcess>(
    mut caller: Caller<'_, T>,
    fd: i32,
    iovs: i32,
    iovs_len: i32,
    nwritten_ptr: i32,
) -> i32 {
    let Some(bytes) = gather_iovecs(&caller, iovs, iovs_len) else {
        return ERRNO_FAULT;
    };
    let Some(count) = caller.data_mut().process_mut().write(fd as u32, &bytes) else {
        return ERRNO_BADF;
    };
    errno(write_guest(&mut caller, nwritten_ptr, &(count as u32).to_le_bytes()))
}

fn fd_read<T: HasProcess>(
    mut caller: Caller<'_, T>,
    fd: i32,
    iovs: i32,
    iovs_len: i32,
    nread_ptr: i32,
) -> i32 {
    let Some(targets) = read_iovecs(&caller, iovs, iovs_len) else {
        return ERRNO_FAULT;
    };
    let mut total = 0u32;
    for (ptr, len) in targets {
        let mut chunk = vec![0u8; len as usize];
        let Some(n) = caller.data_mut().process_mut().read(fd as u32, &mut chunk) else {
            return ERRNO_BADF;
        };
        if write_guest(&mut caller, ptr as i32, &chunk[..n]).is_none() {
            return ERRNO_FAULT;
        }
        total += n as u32;
        if n < len as usize {
            break;
        }
    }
    errno(write_guest(&mut caller, nread_ptr, &total.to_le_bytes()))
}

fn args_sizes_get<T: HasProcess>(mut caller: Caller<'_, T>, argc_ptr: i32, size_ptr: i32) -> i32 {
    let args = caller.data().process().arg_bytes();
    let size: usize = args.iter().map(Vec::len).sum();
    errno(write_u32_pair(
        &mut caller,
        argc_ptr,
        args.len() as u32,
        size_ptr,
        size as u32,
    ))
}

fn args_get<T: HasProcess>(mut caller: Caller<'_, T>, argv_ptr: i32, buf_ptr: i32) -> i32 {
    let args = caller.data().process().arg_bytes();
    let mut offset = buf_ptr as u32;
    for (i, arg) in args.iter().enumerate() {
        let slot = (argv_ptr as u32).wrapping_add(4 * i as u32);
        if write_guest(&mut caller, slot as i32, &offset.to_le_bytes()).is_none()
            || write_guest(&mut caller, offset as i32, arg).is_none()
        {
            return ERRNO_FAULT;
        }
        offset = offset.wrapping_add(arg.len() as u32);
    }
    ERRNO_SUCCESS
}

fn fd_fdstat_get<T: HasProcess>(mut caller: Caller<'_, T>, fd: i32, stat_ptr: i32) -> i32 {
    if !(0..=2).contains(&fd) {
        return ERRNO_BADF;
    }
    // filetype u8, flags u16, rights_base u64, rights_inheriting u64
    let mut stat = [0u8; 24];
    stat[0] = FILETYPE_CHARACTER_DEVICE;
    errno(write_guest(&mut caller, stat_ptr, &stat))
}

fn errno(written: Option<()>) -> i32 {
    match written {
        Some(()) => ERRNO_SUCCESS,
        None => ERRNO_FAULT,
    }
}

fn exported_memory<T>(caller: &Caller<'_, T>) -> Option<Memory> {
    caller.get_export("memory").and_then(Extern::into_memory)
}

fn read_guest<T>(caller: &Caller<'_, T>, ptr: i32, buf: &mut [u8]) -> Option<()> {
    let memory = exported_memory(caller)?;
    memory.read(caller, ptr as u32 as usize, buf).ok()
}

fn write_guest<T>(caller: &mut Caller<'_, T>, ptr: i32, bytes: &[u8]) -> Option<()> {
    let memory = exported_memory(caller)?;
    memory.write(caller, ptr as u32 as usize, bytes).ok()
}

fn write_u32_pair<T>(caller: &mut Caller<'_, T>, a_ptr: i32, a: u32, b_ptr: i32, b: u32) -> Option<()> {
    write_guest(caller, a_ptr, &a.to_le_bytes())?;
    write_guest(caller, b_ptr, &b.to_le_bytes())
}

fn read_u32<T>(caller: &Caller<'_, T>, ptr: u32) -> Option<u32> {
    let mut word = [0u8; 4];
    read_guest(caller, ptr as i32, &mut word)?;
    Some(u32::from_le_bytes(word))
}

/// `(buf, len)` pairs of an iovec array, each checked against the guest's
/// memory size.
fn read_iovecs<T>(caller: &Caller<'_, T>, iovs: i32, iovs_len: i32) -> Option<Vec<(u32, u32)>> {
    let memory_len = exported_memory(caller)?.data(caller).len() as u64;
    (0..iovs_len as u32)
        .map(|i| {
            let base = (iovs as u32).wrapping_add(i.wrapping_mul(8));
            let ptr = read_u32(caller, base)?;
            let len = read_u32(caller, base.wrapping_add(4))?;
            (u64::from(ptr) + u64::from(len) <= memory_len).then_some((ptr, len))
        })
        .collect()
}

fn gather_iovecs<T>(caller: &Caller<'_, T>, iovs: i32, iovs_len: i32) -> Option<Vec<u8>> {
    let mut bytes = Vec::new();
    for (ptr, len) in read_iovecs(caller, iovs, iovs_len)? {
        let mut chunk = vec![0u8; len as usize];
        read_guest(caller, ptr as i32, &mut chunk)?;
        bytes.extend_from_slice(&chunk);
    }
    Some(bytes)
}
