mod executables;
mod logging;
mod process;

pub use executables::{
    QEMU_SYSTEM_PREFIX, can_execute, find_qemu_executables, find_qemu_executables_in,
};
pub use logging::{default_home_dir, init_logging};
pub use process::{
    exit_code_of, is_killable_pid, is_marker_owner, is_process_alive, kill_process,
};

#[cfg(all(test, unix))]
pub(crate) use process::test_support;
