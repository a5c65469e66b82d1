#![forbid(unsafe_code)]

/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

//! Guarded std primitives
//!
//! Each wrapper binds the std entry point through
//! [`Engine::enter_native`](crate::Engine::enter_native) of the installed
//! engine and calls whatever comes back. With no engine installed the std
//! function is called directly.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! blockwatch::install_local()?;
//! blockwatch::natives::sleep(Duration::from_millis(5))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Generic primitives (`Condvar::wait`) bind a unit entry point: the engine
//! admits or rejects the call and the wrapper performs it.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::process::{Child, Command, Output};
use std::sync::{Condvar, LockResult, MutexGuard, WaitTimeoutResult};
use std::thread;
use std::time::Duration;

use crate::host::local::try_enter_frame;
use crate::policy::MemberRef;
use crate::report::BlockingOperationError;

/// `std::thread::sleep`
pub const THREAD_SLEEP: MemberRef = MemberRef::per_type("std::thread::Thread", "sleep").native();
/// `std::thread::yield_now`
pub const THREAD_YIELD: MemberRef =
    MemberRef::per_type("std::thread::Thread", "yield_now").native();
/// `std::thread::park`
pub const THREAD_PARK: MemberRef = MemberRef::per_type("std::thread::Thread", "park").native();
/// `std::thread::park_timeout`
pub const THREAD_PARK_TIMEOUT: MemberRef =
    MemberRef::per_type("std::thread::Thread", "park_timeout").native();
/// `Condvar::wait`
pub const CONDVAR_WAIT: MemberRef = MemberRef::instance("std::sync::Condvar", "wait").native();
/// `Condvar::wait_timeout`
pub const CONDVAR_WAIT_TIMEOUT: MemberRef =
    MemberRef::instance("std::sync::Condvar", "wait_timeout").native();
/// `File::read`
pub const FILE_READ: MemberRef = MemberRef::instance("std::fs::File", "read").native();
/// `File::write`
pub const FILE_WRITE: MemberRef = MemberRef::instance("std::fs::File", "write").native();
/// `TcpStream::connect`
pub const TCP_CONNECT: MemberRef = MemberRef::per_type("std::net::TcpStream", "connect").native();
/// `TcpStream::read`
pub const TCP_READ: MemberRef = MemberRef::instance("std::net::TcpStream", "read").native();
/// `TcpStream::write`
pub const TCP_WRITE: MemberRef = MemberRef::instance("std::net::TcpStream", "write").native();
/// `TcpListener::accept`
pub const TCP_ACCEPT: MemberRef = MemberRef::instance("std::net::TcpListener", "accept").native();
/// `UdpSocket::send_to`
pub const UDP_SEND_TO: MemberRef = MemberRef::instance("std::net::UdpSocket", "send_to").native();
/// `UdpSocket::recv_from`
pub const UDP_RECV_FROM: MemberRef =
    MemberRef::instance("std::net::UdpSocket", "recv_from").native();
/// `Command::spawn`
pub const PROCESS_SPAWN: MemberRef = MemberRef::instance("std::process::Command", "spawn").native();
/// `Command::output`
pub const PROCESS_OUTPUT: MemberRef =
    MemberRef::instance("std::process::Command", "output").native();
/// Writes to the process stdout
pub const STDOUT_WRITE: MemberRef = MemberRef::instance("std::io::Stdout", "write").native();
/// Writes to the process stderr
pub const STDERR_WRITE: MemberRef = MemberRef::instance("std::io::Stderr", "write").native();

/// Every guarded primitive, all of them blocking in [`crate::Policy::std`]
pub const STD_NATIVES: &[MemberRef] = &[
    THREAD_SLEEP,
    THREAD_YIELD,
    THREAD_PARK,
    THREAD_PARK_TIMEOUT,
    CONDVAR_WAIT,
    CONDVAR_WAIT_TIMEOUT,
    FILE_READ,
    FILE_WRITE,
    TCP_CONNECT,
    TCP_READ,
    TCP_WRITE,
    TCP_ACCEPT,
    UDP_SEND_TO,
    UDP_RECV_FROM,
    PROCESS_SPAWN,
    PROCESS_OUTPUT,
    STDOUT_WRITE,
    STDERR_WRITE,
];

/// [`Console::write`] frame, allowed by the stdio integration
pub const CONSOLE_WRITE: MemberRef = MemberRef::instance("blockwatch::natives::Console", "write");
/// [`Console::flush`] frame, allowed by the stdio integration
pub const CONSOLE_FLUSH: MemberRef = MemberRef::instance("blockwatch::natives::Console", "flush");

/// Binds `original` through the installed engine
#[inline]
fn bind<F>(member: &MemberRef, original: F) -> Result<F, BlockingOperationError>
where
    F: Copy + Send + Sync + 'static,
{
    match crate::installed() {
        Some(engine) => engine.enter_native(member, original),
        None => Ok(original),
    }
}

/// Guarded `std::thread::sleep`
///
/// # Errors
///
/// Returns the violation if the calling thread must not block.
pub fn sleep(duration: Duration) -> Result<(), BlockingOperationError> {
    let sleep = bind(&THREAD_SLEEP, thread::sleep as fn(Duration))?;
    sleep(duration);
    Ok(())
}

/// Guarded `std::thread::yield_now`
///
/// # Errors
///
/// Returns the violation if the calling thread must not block.
pub fn yield_now() -> Result<(), BlockingOperationError> {
    let yield_now = bind(&THREAD_YIELD, thread::yield_now as fn())?;
    yield_now();
    Ok(())
}

/// Guarded `std::thread::park`
///
/// # Errors
///
/// Returns the violation if the calling thread must not block.
pub fn park() -> Result<(), BlockingOperationError> {
    let park = bind(&THREAD_PARK, thread::park as fn())?;
    park();
    Ok(())
}

/// Guarded `std::thread::park_timeout`
///
/// # Errors
///
/// Returns the violation if the calling thread must not block.
pub fn park_timeout(timeout: Duration) -> Result<(), BlockingOperationError> {
    let park_timeout = bind(&THREAD_PARK_TIMEOUT, thread::park_timeout as fn(Duration))?;
    park_timeout(timeout);
    Ok(())
}

/// Guarded `Condvar::wait`.
///
/// On a violation `guard` is dropped, releasing the lock.
///
/// # Errors
///
/// Returns the violation if the calling thread must not block.
pub fn condvar_wait<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
) -> Result<LockResult<MutexGuard<'a, T>>, BlockingOperationError> {
    bind(&CONDVAR_WAIT, ())?;
    Ok(condvar.wait(guard))
}

/// Guarded `Condvar::wait_timeout`.
///
/// On a violation `guard` is dropped, releasing the lock.
///
/// # Errors
///
/// Returns the violation if the calling thread must not block.
pub fn condvar_wait_timeout<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> Result<LockResult<(MutexGuard<'a, T>, WaitTimeoutResult)>, BlockingOperationError> {
    bind(&CONDVAR_WAIT_TIMEOUT, ())?;
    Ok(condvar.wait_timeout(guard, timeout))
}

fn connect_addr(addr: &SocketAddr) -> io::Result<TcpStream> {
    TcpStream::connect(addr)
}

/// Guarded `TcpStream::connect`
///
/// # Errors
///
/// Returns the connect error, or the violation as [`io::ErrorKind::Other`].
pub fn tcp_connect(addr: &SocketAddr) -> io::Result<TcpStream> {
    let connect = bind(
        &TCP_CONNECT,
        connect_addr as fn(&SocketAddr) -> io::Result<TcpStream>,
    )?;
    connect(addr)
}

/// Guarded `TcpListener::accept`
///
/// # Errors
///
/// Returns the accept error, or the violation as [`io::ErrorKind::Other`].
pub fn tcp_accept(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
    let accept = bind(
        &TCP_ACCEPT,
        TcpListener::accept as fn(&TcpListener) -> io::Result<(TcpStream, SocketAddr)>,
    )?;
    accept(listener)
}

fn send_to_addr(socket: &UdpSocket, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
    socket.send_to(buf, addr)
}

/// Guarded `UdpSocket::send_to`
///
/// # Errors
///
/// Returns the send error, or the violation as [`io::ErrorKind::Other`].
pub fn udp_send_to(socket: &UdpSocket, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
    let send_to = bind(
        &UDP_SEND_TO,
        send_to_addr as fn(&UdpSocket, &[u8], SocketAddr) -> io::Result<usize>,
    )?;
    send_to(socket, buf, addr)
}

/// Guarded `UdpSocket::recv_from`
///
/// # Errors
///
/// Returns the receive error, or the violation as [`io::ErrorKind::Other`].
pub fn udp_recv_from(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    let recv_from = bind(
        &UDP_RECV_FROM,
        UdpSocket::recv_from as fn(&UdpSocket, &mut [u8]) -> io::Result<(usize, SocketAddr)>,
    )?;
    recv_from(socket, buf)
}

/// Guarded `Command::spawn`
///
/// # Errors
///
/// Returns the spawn error, or the violation as [`io::ErrorKind::Other`].
pub fn spawn(command: &mut Command) -> io::Result<Child> {
    let spawn = bind(
        &PROCESS_SPAWN,
        Command::spawn as fn(&mut Command) -> io::Result<Child>,
    )?;
    spawn(command)
}

/// Guarded `Command::output`
///
/// # Errors
///
/// Returns the process error, or the violation as [`io::ErrorKind::Other`].
pub fn output(command: &mut Command) -> io::Result<Output> {
    let output = bind(
        &PROCESS_OUTPUT,
        Command::output as fn(&mut Command) -> io::Result<Output>,
    )?;
    output(command)
}

/// Handle types with guarded read and write entry points
pub trait NativeIo: Read + Write + 'static {
    /// Member bound for reads
    const READ: MemberRef;
    /// Member bound for writes
    const WRITE: MemberRef;
}

impl NativeIo for File {
    const READ: MemberRef = FILE_READ;
    const WRITE: MemberRef = FILE_WRITE;
}

impl NativeIo for TcpStream {
    const READ: MemberRef = TCP_READ;
    const WRITE: MemberRef = TCP_WRITE;
}

/// Handle whose reads and writes are guarded
#[derive(Debug)]
pub struct Guarded<T> {
    inner: T,
}

impl<T: NativeIo> Guarded<T> {
    /// Wraps `inner`
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    /// Shared access to the handle, unguarded
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Unwraps the handle
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: NativeIo> Read for Guarded<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = bind(
            &T::READ,
            <T as Read>::read as fn(&mut T, &mut [u8]) -> io::Result<usize>,
        )?;
        read(&mut self.inner, buf)
    }
}

impl<T: NativeIo> Write for Guarded<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let write = bind(
            &T::WRITE,
            <T as Write>::write as fn(&mut T, &[u8]) -> io::Result<usize>,
        )?;
        write(&mut self.inner, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn write_stdout(buf: &[u8]) -> io::Result<usize> {
    io::stdout().write(buf)
}

fn write_stderr(buf: &[u8]) -> io::Result<usize> {
    io::stderr().write(buf)
}

/// Guarded write to the process stdout
///
/// # Errors
///
/// Returns the write error, or the violation as [`io::ErrorKind::Other`].
pub fn stdout_write(buf: &[u8]) -> io::Result<usize> {
    let write = bind(&STDOUT_WRITE, write_stdout as fn(&[u8]) -> io::Result<usize>)?;
    write(buf)
}

/// Guarded write to the process stderr
///
/// # Errors
///
/// Returns the write error, or the violation as [`io::ErrorKind::Other`].
pub fn stderr_write(buf: &[u8]) -> io::Result<usize> {
    let write = bind(&STDERR_WRITE, write_stderr as fn(&[u8]) -> io::Result<usize>)?;
    write(buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleStream {
    Stdout,
    Stderr,
}

/// Process console writer.
///
/// Writes run inside [`CONSOLE_WRITE`] frames, which the stdio integration
/// allows, so diagnostics can be printed from restricted threads.
#[derive(Debug, Clone, Copy)]
pub struct Console {
    stream: ConsoleStream,
}

impl Console {
    /// Console writing to stdout
    #[must_use]
    pub fn stdout() -> Self {
        Self {
            stream: ConsoleStream::Stdout,
        }
    }

    /// Console writing to stderr
    #[must_use]
    pub fn stderr() -> Self {
        Self {
            stream: ConsoleStream::Stderr,
        }
    }
}

impl Write for Console {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _frame = try_enter_frame(&CONSOLE_WRITE)?;
        match self.stream {
            ConsoleStream::Stdout => stdout_write(buf),
            ConsoleStream::Stderr => stderr_write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let _frame = try_enter_frame(&CONSOLE_FLUSH)?;
        match self.stream {
            ConsoleStream::Stdout => io::stdout().flush(),
            ConsoleStream::Stderr => io::stderr().flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natives_are_native_members() {
        assert!(STD_NATIVES.iter().all(|member| member.native));
        assert!(!CONSOLE_WRITE.native);
    }

    #[test]
    fn test_natives_unique() {
        let mut keys: Vec<_> = STD_NATIVES
            .iter()
            .map(|member| (member.declaring_type, member.name))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), STD_NATIVES.len());
    }
}
