use nix::unistd::Pid;

use crate::error::{Error, Result};

// Creates each veth pair with rtnetlink directly rather than shelling out to
// `ip`, so failures surface as typed errors instead of a bare exit status.
pub fn setup_veth_pairs(veth_pairs: &[(String, String)], child: Pid) -> Result<()> {
    if veth_pairs.is_empty() {
        return Ok(());
    }
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Setup(format!("failed to start netlink runtime: {e}")))?;
    rt.block_on(setup_veth_pairs_async(veth_pairs, child))
}

async fn setup_veth_pairs_async(veth_pairs: &[(String, String)], child: Pid) -> Result<()> {
    let (connection, handle, _) = rtnetlink::new_connection()
        .map_err(|e| Error::Setup(format!("failed to open netlink socket: {e}")))?;
    tokio::spawn(connection);

    for (outer, inner) in veth_pairs {
        handle
            .link()
            .add()
            .veth(outer.clone(), inner.clone())
            .execute()
            .await
            .map_err(|e| Error::Setup(format!("failed to create veth pair {outer}:{inner}: {e}")))?;

        let inner_index = link_index_by_name(&handle, inner).await?;
        handle
            .link()
            .set(inner_index)
            .setns_by_pid(child.as_raw() as u32)
            .execute()
            .await
            .map_err(|e| {
                Error::Setup(format!(
                    "failed to move {inner} into container net namespace: {e}"
                ))
            })?;

        let outer_index = link_index_by_name(&handle, outer).await?;
        handle
            .link()
            .set(outer_index)
            .up()
            .execute()
            .await
            .map_err(|e| Error::Setup(format!("failed to bring up {outer}: {e}")))?;
    }
    Ok(())
}

async fn link_index_by_name(handle: &rtnetlink::Handle, name: &str) -> Result<u32> {
    use futures::TryStreamExt;
    let mut links = handle.link().get().match_name(name.to_owned()).execute();
    match links
        .try_next()
        .await
        .map_err(|e| Error::Setup(format!("failed to look up link {name}: {e}")))?
    {
        Some(msg) => Ok(msg.header.index),
        None => Err(Error::Setup(format!("link {name} not found after creation"))),
    }
}

// Minimal `struct ifreq` layout for the flags ioctls only.
#[repr(C)]
struct IfreqFlags {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 16],
}

// Brings up `lo` in the current network namespace via the classic ioctl
// pair instead of pulling in netlink for something this small.
pub fn bring_up_loopback() -> Result<()> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(Error::Errno(nix::errno::Errno::last()));
    }
    let result = (|| -> Result<()> {
        let mut ifr: IfreqFlags = unsafe { std::mem::zeroed() };
        let name = b"lo\0";
        for (dst, src) in ifr.name.iter_mut().zip(name.iter()) {
            *dst = *src as libc::c_char;
        }
        if unsafe { libc::ioctl(sock, libc::SIOCGIFFLAGS, &mut ifr) } < 0 {
            return Err(Error::Errno(nix::errno::Errno::last()));
        }
        ifr.flags |= libc::IFF_UP as libc::c_short;
        if unsafe { libc::ioctl(sock, libc::SIOCSIFFLAGS, &mut ifr) } < 0 {
            return Err(Error::Errno(nix::errno::Errno::last()));
        }
        Ok(())
    })();
    unsafe {
        libc::close(sock);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_veth_pairs_is_a_no_op() {
        assert!(setup_veth_pairs(&[], Pid::from_raw(1)).is_ok());
    }
}
