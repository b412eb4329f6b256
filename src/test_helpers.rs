use std::{
    fs::{File, Permissions},
    io::Write,
    os::{fd::AsRawFd, unix::fs::PermissionsExt},
    process::{Command, Output, Stdio},
    thread::sleep,
    time::Duration,
};

use tempdir::TempDir;

/// Writes `binary` to a temporary executable, runs it with `stdin` piped in
/// and collects what it printed.
pub fn create_and_run_bin(binary: &[u8], stdin: &[u8]) -> Output {
    let dir = TempDir::new("tapeir").unwrap();

    let elf_path = dir.path().join("elf");
    let mut elf = File::create(elf_path.clone()).unwrap();
    elf.write_all(binary).unwrap();

    elf.set_permissions(Permissions::from_mode(0o755)).unwrap();

    // Running a file that another thread may still hold open for writing
    // fails with ETXTBSY; taking the locks waits for every writer to close.
    // See: https://github.com/rust-lang/rust/issues/114554#issue-1838269767
    sleep(Duration::from_micros(2));
    unsafe { libc::flock(elf.as_raw_fd(), libc::LOCK_EX) };

    drop(elf);

    let file = File::open(elf_path.clone()).unwrap();
    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_SH) };
    drop(file);

    let mut child = Command::new(elf_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    // dropping the handle closes the pipe, so reads past the input see EOF
    let mut pipe = child.stdin.take().unwrap();
    pipe.write_all(stdin).unwrap();
    drop(pipe);

    child.wait_with_output().unwrap()
}
