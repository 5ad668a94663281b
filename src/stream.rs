use mio::net::TcpStream;
use mio::Evented;
use std::io::{Read, Write};

/// Byte streams the I/O thread can drive: nonblocking, pollable, and
/// sendable to the thread that owns them.
pub trait IoStream: Read + Write + Evented + Send + 'static {}

impl IoStream for TcpStream {}
