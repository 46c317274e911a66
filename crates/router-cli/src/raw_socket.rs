//! Raw `AF_PACKET` frame transport (Linux only): one bound socket per
//! configured interface, with a background reader thread per socket
//! fanning in to a single channel the dispatcher drains. Grounded in the
//! same raw-fd, `libc`-syscall style as the bridge module this project was
//! adapted from, traded from async (`AsyncFd`) to blocking reads since the
//! router's threads are plain OS threads, not a tokio runtime.

#![cfg(target_os = "linux")]

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::mpsc;
use std::thread;

use router_core::Interface;
use router_net::FrameIo;

const ETH_P_ALL: u16 = 0x0003;
const RECV_BUF_LEN: usize = 65536;

pub struct RawSocketFrameIo {
    send_sockets: HashMap<String, OwnedFd>,
    inbound_rx: mpsc::Receiver<(Vec<u8>, String)>,
}

impl RawSocketFrameIo {
    /// Open and bind one `AF_PACKET` socket per interface, spawning a
    /// reader thread for each.
    pub fn new(interfaces: &[Interface]) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut send_sockets = HashMap::new();

        for iface in interfaces {
            let fd = open_bound_socket(&iface.name)?;
            let reader_fd = dup_fd(&fd)?;
            send_sockets.insert(iface.name.clone(), fd);

            let name = iface.name.clone();
            let tx = tx.clone();
            thread::spawn(move || read_loop(reader_fd, name, tx));
        }

        Ok(Self {
            send_sockets,
            inbound_rx: rx,
        })
    }
}

impl FrameIo for RawSocketFrameIo {
    fn recv(&mut self) -> io::Result<(Vec<u8>, String)> {
        self.inbound_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "all interface readers exited"))
    }

    fn send(&mut self, interface: &str, frame: &[u8]) -> io::Result<()> {
        let Some(fd) = self.send_sockets.get(interface) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown interface {interface}"),
            ));
        };

        let n = unsafe { libc::send(fd.as_raw_fd(), frame.as_ptr().cast(), frame.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn read_loop(fd: OwnedFd, interface: String, tx: mpsc::Sender<(Vec<u8>, String)>) {
    let mut buf = [0u8; RECV_BUF_LEN];
    loop {
        let n = unsafe { libc::recv(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n < 0 {
            tracing::warn!(interface = %interface, error = %io::Error::last_os_error(), "raw socket read failed");
            return;
        }
        if n == 0 {
            return;
        }
        if tx.send((buf[..n as usize].to_vec(), interface.clone())).is_err() {
            return;
        }
    }
}

fn open_bound_socket(name: &str) -> io::Result<OwnedFd> {
    let raw = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, i32::from(ETH_P_ALL.to_be())) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let ifindex = interface_index(&fd, name)?;

    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = ETH_P_ALL.to_be();
    addr.sll_ifindex = ifindex;

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            (&addr as *const libc::sockaddr_ll).cast(),
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(fd)
}

fn interface_index(fd: &OwnedFd, name: &str) -> io::Result<i32> {
    let mut ifreq: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifreq.ifr_name.iter_mut().zip(name.bytes()) {
        *dst = src as libc::c_char;
    }

    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCGIFINDEX, &mut ifreq) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { ifreq.ifr_ifru.ifru_ifindex })
}

fn dup_fd(fd: &OwnedFd) -> io::Result<OwnedFd> {
    let dup = unsafe { libc::dup(fd.as_raw_fd()) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}
