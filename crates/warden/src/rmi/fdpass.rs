//! Descriptor passing over unix streams with `SCM_RIGHTS`.
//!
//! Each descriptor rides on a single carrier byte sent after the frame that
//! references it. The receiver reads frames with exact-length reads, so the
//! carrier byte (and its ancillary data) is only ever consumed by `recvmsg`.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg,
};
use tokio::io::Interest;
use tokio::net::UnixStream;

const CARRIER: u8 = 0xfd;

#[cfg(any(target_os = "linux", target_os = "android"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}

pub(crate) async fn send_fd(stream: &UnixStream, fd: BorrowedFd<'_>) -> io::Result<()> {
    let raw = [fd.as_raw_fd()];
    loop {
        stream.writable().await?;
        let sent = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(&[CARRIER])];
            let cmsgs = [ControlMessage::ScmRights(&raw)];
            sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                .map_err(io::Error::from)
        });
        match sent {
            Ok(1) => {
                tracing::trace!(fd = raw[0], "Sent descriptor");
                return Ok(());
            }
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "descriptor carrier byte not sent",
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

pub(crate) async fn recv_fd(stream: &UnixStream) -> io::Result<OwnedFd> {
    loop {
        stream.readable().await?;
        let received = stream.try_io(Interest::READABLE, || {
            let mut carrier = [0u8; 1];
            let mut iov = [IoSliceMut::new(&mut carrier)];
            let mut space = nix::cmsg_space!([RawFd; 1]);
            let msg = recvmsg::<UnixAddr>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut space),
                recv_flags(),
            )
            .map_err(io::Error::from)?;
            if msg.bytes == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed before descriptor arrived",
                ));
            }
            let mut raw = Vec::new();
            for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    raw.extend(fds);
                }
            }
            Ok(raw)
        });
        match received {
            Ok(raw) => return adopt_single(raw),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

fn adopt_single(raw: Vec<RawFd>) -> io::Result<OwnedFd> {
    // SAFETY: descriptors delivered through SCM_RIGHTS were just installed in
    // this process's table and nothing else holds them.
    let mut owned: Vec<OwnedFd> = raw
        .into_iter()
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();
    match owned.len() {
        1 => owned
            .pop()
            .ok_or_else(|| io::Error::other("descriptor vanished")),
        0 => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "carrier byte arrived without a descriptor",
        )),
        n => {
            tracing::warn!(count = n, "Carrier byte held several descriptors, closing extras");
            owned.truncate(1);
            owned
                .pop()
                .ok_or_else(|| io::Error::other("descriptor vanished"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, Write};
    use std::os::fd::AsFd;

    #[tokio::test]
    async fn descriptor_crosses_socket_pair() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"policy").unwrap();

        send_fd(&a, file.as_fd()).await.unwrap();
        let received = recv_fd(&b).await.unwrap();

        let mut dup = std::fs::File::from(received);
        dup.rewind().unwrap();
        let mut contents = String::new();
        dup.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "policy");
    }

    #[tokio::test]
    async fn plain_byte_is_not_a_descriptor() {
        use tokio::io::AsyncWriteExt;

        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(&[CARRIER]).await.unwrap();

        let err = recv_fd(&b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
