//! Best-effort DHCP lease release.
//!
//! When a VM goes away its lease would otherwise linger until expiry. The
//! driver sends a DHCPRELEASE on the bridge the lease came from, impersonating
//! the guest: client hardware address = the VM's MAC, ciaddr = the leased IP,
//! server identifier = the bridge address. Failures here are logged by the
//! caller, never surfaced.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::net::{Ipv4Addr, SocketAddrV4};

use tokio::net::UdpSocket;

use crate::error::{Result, VirtError};

const DHCP_SERVER_PORT: u16 = 67;
const BOOTP_REQUEST: u8 = 1;
const HTYPE_ETHERNET: u8 = 1;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_CLIENT_ID: u8 = 61;
const OPT_END: u8 = 255;
const DHCP_RELEASE: u8 = 7;
/// Classic BOOTP minimum frame size.
const PACKET_LEN: usize = 300;

/// Parse a colon-separated MAC address.
pub fn parse_mac(mac: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = 0;
    for (i, part) in mac.split(':').enumerate() {
        if i >= 6 {
            return None;
        }
        out[i] = u8::from_str_radix(part, 16).ok()?;
        parts += 1;
    }
    (parts == 6).then_some(out)
}

/// Assemble a DHCPRELEASE frame.
pub fn release_packet(mac: [u8; 6], client_ip: Ipv4Addr, server_ip: Ipv4Addr, xid: u32) -> Vec<u8> {
    let mut packet = vec![0u8; PACKET_LEN];
    packet[0] = BOOTP_REQUEST;
    packet[1] = HTYPE_ETHERNET;
    packet[2] = 6; // hlen
    packet[4..8].copy_from_slice(&xid.to_be_bytes());
    packet[12..16].copy_from_slice(&client_ip.octets()); // ciaddr
    packet[28..34].copy_from_slice(&mac); // chaddr
    packet[236..240].copy_from_slice(&MAGIC_COOKIE);

    let mut i = 240;
    packet[i] = OPT_MESSAGE_TYPE;
    packet[i + 1] = 1;
    packet[i + 2] = DHCP_RELEASE;
    i += 3;
    packet[i] = OPT_SERVER_ID;
    packet[i + 1] = 4;
    packet[i + 2..i + 6].copy_from_slice(&server_ip.octets());
    i += 6;
    packet[i] = OPT_CLIENT_ID;
    packet[i + 1] = 7;
    packet[i + 2] = HTYPE_ETHERNET;
    packet[i + 3..i + 9].copy_from_slice(&mac);
    i += 9;
    packet[i] = OPT_END;

    packet
}

/// Send a DHCPRELEASE for `{mac, client_ip}` to the DHCP authority at
/// `server_ip`, from a socket bound to `bridge_dev` so the frame leaves on
/// the right interface.
pub async fn send_release(
    bridge_dev: &str,
    mac: &str,
    client_ip: Ipv4Addr,
    server_ip: Ipv4Addr,
) -> Result<()> {
    let hwaddr = parse_mac(mac)
        .ok_or_else(|| VirtError::Validation(vec![format!("invalid MAC address {mac:?}")]))?;

    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    nix::sys::socket::setsockopt(
        &socket,
        nix::sys::socket::sockopt::BindToDevice,
        &std::ffi::OsString::from(bridge_dev),
    )
    .map_err(std::io::Error::from)?;
    socket.set_nonblocking(true)?;
    let socket = UdpSocket::from_std(socket)?;

    let xid = {
        let mut hasher = RandomState::new().build_hasher();
        hasher.write(mac.as_bytes());
        hasher.write(&client_ip.octets());
        hasher.finish() as u32
    };
    let packet = release_packet(hwaddr, client_ip, server_ip, xid);
    socket
        .send_to(&packet, SocketAddrV4::new(server_ip, DHCP_SERVER_PORT))
        .await?;

    tracing::debug!("Released DHCP lease {client_ip} ({mac}) on {bridge_dev}");
    Ok(())
}
