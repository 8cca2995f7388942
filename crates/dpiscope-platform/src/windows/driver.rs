//! WinDivert driver wrapper
//!
//! Safe Rust wrapper around WinDivert using the `windivert` crate.

use crate::error::{PlatformError, Result};
use crate::filter::validate_filter;
use crate::traits::{CapturedPacket, PacketAddress, PacketCapture};
use tracing::{debug, info, warn};
use windivert::layer::NetworkLayer;
use windivert::prelude::*;
use windivert_sys::ChecksumFlags;

/// WinDivert network-layer handle opened in active (modify-or-drop) mode
///
/// # Example
///
/// ```rust,ignore
/// use dpiscope_platform::windows::WinDivertDriver;
/// use dpiscope_platform::{FilterPresets, PacketCapture};
///
/// let mut driver = WinDivertDriver::open(&FilterPresets::all_ip(), 0)?;
/// let captured = driver.recv()?;
/// driver.send(&captured.data, &captured.address)?;
/// ```
pub struct WinDivertDriver {
    handle: Option<WinDivert<NetworkLayer>>,
    filter: String,
    recv_buffer: Vec<u8>,
}

// Safety: WinDivert handle can be sent between threads
unsafe impl Send for WinDivertDriver {}

impl WinDivertDriver {
    /// Maximum packet size
    pub const MAX_PACKET_SIZE: usize = 65535;

    /// Open a network-layer handle for `filter`
    ///
    /// # Errors
    /// Returns error if the filter is rejected, the driver cannot be loaded,
    /// or the process is not elevated.
    pub fn open(filter: &str, priority: i16) -> Result<Self> {
        validate_filter(filter)?;
        if !super::is_elevated() {
            return Err(PlatformError::PermissionDenied(
                "WinDivert needs an elevated (administrator) process".into(),
            ));
        }

        info!(filter, priority, "Opening WinDivert handle");
        let handle = WinDivert::network(filter, priority, WinDivertFlags::new())
            .map_err(|e| PlatformError::DriverInitFailed(format!("WinDivertOpen failed: {e:?}")))?;
        info!("WinDivert handle opened");

        Ok(Self {
            handle: Some(handle),
            filter: filter.to_string(),
            recv_buffer: vec![0u8; Self::MAX_PACKET_SIZE],
        })
    }

    /// Filter the handle was opened with
    pub fn filter(&self) -> &str {
        &self.filter
    }

    fn handle(&self) -> Result<&WinDivert<NetworkLayer>> {
        self.handle
            .as_ref()
            .ok_or_else(|| PlatformError::HandleError("Handle not open".into()))
    }
}

impl PacketCapture for WinDivertDriver {
    fn recv(&mut self) -> Result<CapturedPacket> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| PlatformError::HandleError("Handle not open".into()))?;

        let packet = handle
            .recv(&mut self.recv_buffer)
            .map_err(|e| PlatformError::CaptureError(format!("Recv failed: {e:?}")))?;

        let wd_addr = &packet.address;
        let address = PacketAddress {
            interface_index: wd_addr.interface_index(),
            subinterface_index: wd_addr.subinterface_index(),
            outbound: wd_addr.outbound(),
            loopback: wd_addr.loopback(),
            impostor: wd_addr.impostor(),
            ipv6: wd_addr.ipv6(),
        };

        Ok(CapturedPacket {
            data: packet.data.to_vec(),
            direction: address.direction(),
            address,
        })
    }

    fn send(&mut self, packet: &[u8], addr: &PacketAddress) -> Result<()> {
        let handle = self.handle()?;

        // SAFETY: every field the driver reads is set below
        let mut wd_addr = unsafe { WinDivertAddress::<NetworkLayer>::new() };
        wd_addr.set_outbound(addr.outbound);
        wd_addr.set_loopback(addr.loopback);
        wd_addr.set_impostor(addr.impostor);
        wd_addr.set_ip_checksum(false);
        wd_addr.set_tcp_checksum(false);
        wd_addr.set_udp_checksum(false);
        wd_addr.set_interface_index(addr.interface_index);
        wd_addr.set_subinterface_index(addr.subinterface_index);

        let mut wd_packet = WinDivertPacket::<NetworkLayer> {
            address: wd_addr,
            data: packet.to_vec().into(),
        };

        // The chain already fixed checksums of what it touched; the driver
        // pass also covers fields it cannot see (offload flags)
        if let Err(e) = wd_packet.recalculate_checksums(ChecksumFlags::default()) {
            warn!("Failed to recalculate checksums: {:?}", e);
        }

        handle
            .send(&wd_packet)
            .map_err(|e| PlatformError::InjectionError(format!("Send failed: {e:?}")))?;
        debug!(len = packet.len(), outbound = addr.outbound, "reinjected");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.handle.take().is_some() {
            info!("Closed WinDivert handle");
        }
        Ok(())
    }
}

impl Drop for WinDivertDriver {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
