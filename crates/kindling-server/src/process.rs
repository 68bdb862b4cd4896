//! Process titles and signal handling of master and worker processes.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
};

use tracing::{event, Level};

/// Longest thread name the kernel keeps, without the terminator.
const THREAD_NAME_LEN: usize = 15;

/// Part a process plays in the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.write_str("master"),
            Role::Worker => f.write_str("worker"),
        }
    }
}

struct Flags {
    reload: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

fn flags() -> &'static Flags {
    static FLAGS: OnceLock<Flags> = OnceLock::new();

    FLAGS.get_or_init(|| Flags {
        reload: Arc::default(),
        shutdown: Arc::default(),
    })
}

/// Prepare the calling process to act as the master.
pub fn master_init(program: &str) {
    set_title(program, Role::Master);
    sys::register_master(&flags().shutdown);
}

/// Prepare a freshly spawned worker process.
///
/// Workers inherit the master's handlers, so termination signals get their default action
/// back, and the reload signal is installed.
pub fn worker_init(program: &str) {
    set_title(program, Role::Worker);
    sys::register_worker(&flags().reload);
}

/// Set the title the OS shows for this process.
///
/// On Linux the argument area is rewritten, so tools reading the command line show the full
/// title. The calling thread is named as well, as far as the kernel's 15 bytes allow.
pub fn set_title(program: &str, role: Role) {
    event!(Level::DEBUG, title = %title(program, role), "setting process title");

    sys::set_cmdline(program, role);
    sys::set_thread_name(&short_title(program, role));
}

/// Full title of a process, `"<program>: <role> process"`.
pub fn title(program: &str, role: Role) -> String {
    fit_title(program, &format!(": {} process", role), usize::MAX)
}

/// Title cut to a thread name, shortening the program rather than the role.
pub fn short_title(program: &str, role: Role) -> String {
    fit_title(program, &format!(": {}", role), THREAD_NAME_LEN)
}

fn fit_title(program: &str, suffix: &str, capacity: usize) -> String {
    let program = truncate(program, capacity.saturating_sub(suffix.len()));

    let mut title = format!("{}{}", program, suffix);
    let len = truncate(&title, capacity).len();
    title.truncate(len);

    title
}

fn truncate(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }

    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Check and clear a pending reload request.
pub fn take_reload_request() -> bool {
    flags().reload.swap(false, Ordering::SeqCst)
}

pub fn shutdown_requested() -> bool {
    flags().shutdown.load(Ordering::SeqCst)
}

#[cfg(unix)]
mod sys {
    use std::sync::{atomic::AtomicBool, Arc};

    use signal_hook::{
        consts::{SIGHUP, SIGINT, SIGTERM},
        flag,
    };
    use tracing::{event, Level};

    pub fn register_master(shutdown: &Arc<AtomicBool>) {
        for signal in [SIGINT, SIGTERM] {
            if let Err(error) = flag::register(signal, shutdown.clone()) {
                event!(Level::WARN, signal, ?error, "failed to install signal handler");
            }
        }
    }

    pub fn register_worker(reload: &Arc<AtomicBool>) {
        // Always set, the default action runs on every termination signal
        let terminate = Arc::new(AtomicBool::new(true));
        for signal in [SIGINT, SIGTERM] {
            if let Err(error) = flag::register_conditional_default(signal, terminate.clone()) {
                event!(Level::WARN, signal, ?error, "failed to restore signal handler");
            }
        }

        if let Err(error) = flag::register(SIGHUP, reload.clone()) {
            event!(Level::WARN, signal = SIGHUP, ?error, "failed to install signal handler");
        }
    }

    #[cfg(target_os = "linux")]
    pub fn set_cmdline(program: &str, role: super::Role) {
        use std::{fs, ptr};

        let area = fs::read_to_string("/proc/self/stat")
            .ok()
            .and_then(|stat| argv_area(&stat));
        let Some((start, end)) = area else {
            event!(Level::DEBUG, "argument area unknown, keeping command line");
            return;
        };

        // One byte stays for the terminator
        let capacity = end - start;
        let title = super::fit_title(
            program,
            &format!(": {} process", role),
            capacity.saturating_sub(1),
        );

        let mut buffer = vec![0u8; capacity];
        buffer[..title.len()].copy_from_slice(title.as_bytes());

        // SAFETY: The kernel reports [start, end) as this process's argument strings, which stay
        // mapped and writable for the lifetime of the process, and the buffer is exactly as long
        unsafe {
            ptr::copy_nonoverlapping(buffer.as_ptr(), start as *mut u8, capacity);
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn set_cmdline(_program: &str, _role: super::Role) {}

    /// Start and end address of the argument strings, from the contents of `/proc/self/stat`.
    #[cfg(target_os = "linux")]
    pub fn argv_area(stat: &str) -> Option<(usize, usize)> {
        // The command name may contain anything, fields are counted after its closing paren
        let rest = &stat[stat.rfind(')')? + 1..];

        // arg_start and arg_end are fields 48 and 49, the first field after the name is 3
        let mut fields = rest.split_whitespace().skip(45);
        let start: usize = fields.next()?.parse().ok()?;
        let end: usize = fields.next()?.parse().ok()?;

        (end > start).then_some((start, end))
    }

    #[cfg(target_os = "linux")]
    pub fn set_thread_name(name: &str) {
        use std::ffi::CString;

        let Ok(name) = CString::new(name.replace('\0', "")) else {
            return;
        };

        // SAFETY: PR_SET_NAME reads a nul-terminated string, and truncates it to 16 bytes
        unsafe {
            libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0);
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn set_thread_name(_name: &str) {}
}

#[cfg(not(unix))]
mod sys {
    use std::sync::{atomic::AtomicBool, Arc};

    pub fn register_master(_shutdown: &Arc<AtomicBool>) {}

    pub fn register_worker(_reload: &Arc<AtomicBool>) {}

    pub fn set_cmdline(_program: &str, _role: super::Role) {}

    pub fn set_thread_name(_name: &str) {}
}
