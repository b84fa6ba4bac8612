//! Low-level socket helpers shared by the ingress and splice listeners.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

/// Bind a TCP listener with `SO_REUSEADDR` and an explicit backlog, which
/// `TcpListener::bind` does not expose.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
	let domain = if addr.is_ipv4() {
		Domain::IPV4
	} else {
		Domain::IPV6
	};
	let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
	socket.set_reuse_address(true)?;
	socket.bind(&addr.into())?;
	socket.listen(backlog)?;
	socket.set_nonblocking(true)?;
	TcpListener::from_std(socket.into())
}

/// Duplicate the fd of a live agent socket so its kernel TCP state stays
/// observable after ownership of the stream moves into a splice.
#[cfg(unix)]
pub fn clone_probe(sock: &tokio::net::TcpStream) -> Option<std::net::TcpStream> {
	use std::os::fd::AsFd;
	sock
		.as_fd()
		.try_clone_to_owned()
		.map(std::net::TcpStream::from)
		.ok()
}

#[cfg(not(unix))]
pub fn clone_probe(_sock: &tokio::net::TcpStream) -> Option<std::net::TcpStream> {
	None
}

/// Whether the socket is still in the `ESTABLISHED` TCP state.
///
/// On Linux this reads `TCP_INFO`; on other unix platforms we fall back to a
/// non-blocking `MSG_PEEK`, which cannot distinguish `ESTABLISHED` from
/// half-closed states but does detect a fully closed peer.
#[cfg(target_os = "linux")]
pub fn established<S: std::os::fd::AsFd>(sock: &S) -> bool {
	use std::os::fd::AsRawFd;

	const TCP_STATE_ESTABLISHED: u8 = 1;

	let fd = sock.as_fd().as_raw_fd();
	let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
	let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
	let ret = unsafe {
		libc::getsockopt(
			fd,
			libc::IPPROTO_TCP,
			libc::TCP_INFO,
			&mut info as *mut _ as *mut libc::c_void,
			&mut len,
		)
	};
	ret == 0 && info.tcpi_state == TCP_STATE_ESTABLISHED
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn established<S: std::os::fd::AsFd>(sock: &S) -> bool {
	use std::os::fd::AsRawFd;

	let fd = sock.as_fd().as_raw_fd();
	let mut buf = [0u8; 1];
	let n = unsafe {
		libc::recv(
			fd,
			buf.as_mut_ptr() as *mut libc::c_void,
			1,
			libc::MSG_PEEK | libc::MSG_DONTWAIT,
		)
	};
	if n > 0 {
		return true;
	}
	if n == 0 {
		// Orderly shutdown from the peer.
		return false;
	}
	let err = io::Error::last_os_error();
	err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(not(unix))]
pub fn established<S>(_sock: &S) -> bool {
	true
}
