use crate::error::{IngestError, RejectReason};
use crate::evaluator::{Evaluator, IngestMode};
use crate::geocode::ReverseGeocoder;
use crate::schedule::Clock;
use crate::stats::IngestStats;
use crate::store::DeviceRepository;
use crate::telemetry::{decode, TelemetryPacket};
use crate::types::{HeartbeatUpdate, WindReading};
use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

const MAX_DATAGRAM: usize = 65_535;

/// Resolves the device for a decoded packet, writes the heartbeat and hands the reading to the
/// evaluator. This is the only writer of device heartbeat and location.
pub struct PacketHandler {
    devices: Arc<dyn DeviceRepository>,
    geocoder: Arc<dyn ReverseGeocoder>,
    evaluator: Evaluator,
    clock: Arc<dyn Clock>,
    stats: Arc<IngestStats>,
}

impl PacketHandler {
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        geocoder: Arc<dyn ReverseGeocoder>,
        evaluator: Evaluator,
        clock: Arc<dyn Clock>,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            devices,
            geocoder,
            evaluator,
            clock,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub async fn handle(
        &self,
        packet: &TelemetryPacket,
        mode: IngestMode,
    ) -> Result<WindReading, IngestError> {
        let device = self
            .devices
            .find_device(&packet.device_id)
            .await?
            .ok_or(IngestError::Rejected(RejectReason::UnknownDevice))?;
        let thresholds = self
            .devices
            .find_thresholds(&device.id)
            .await?
            .ok_or(IngestError::Rejected(RejectReason::MissingThresholds))?;

        // Looked up only when the location is first filled; an empty or failed lookup is not
        // retried on later packets.
        let place_name = match packet.gps {
            Some(fix) if device.location().is_none() => {
                match self.geocoder.place_name(fix).await {
                    Ok(name) => name,
                    Err(err) => {
                        tracing::warn!(device_id = %device.id, error = %format!("{err:#}"), "reverse geocoding failed");
                        None
                    }
                }
            }
            _ => None,
        };
        self.devices
            .record_heartbeat(
                &device.id,
                &HeartbeatUpdate {
                    seen_at: self.clock.now(),
                    location: packet.gps,
                    place_name,
                },
            )
            .await?;

        let stored = self
            .evaluator
            .ingest(&device, thresholds, packet, mode)
            .await?;
        Ok(stored)
    }

    /// Decodes and handles one datagram. Every failure is logged here and nothing is returned to
    /// the sender.
    pub async fn process_datagram(&self, bytes: &[u8], peer: Option<SocketAddr>) {
        IngestStats::incr(&self.stats.packets_received);
        let packet = match decode(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                IngestStats::incr(&self.stats.packets_rejected);
                tracing::debug!(peer = ?peer, error = %err, "dropping malformed datagram");
                return;
            }
        };

        match self.handle(&packet, IngestMode::Live).await {
            Ok(_) => {}
            Err(IngestError::Rejected(reason)) => {
                IngestStats::incr(&self.stats.packets_rejected);
                tracing::warn!(device_id = %packet.device_id, peer = ?peer, reason = %reason, "dropping packet");
            }
            Err(IngestError::Store(err)) => {
                let message = format!("{err:#}");
                self.stats.record_error(message.clone());
                tracing::warn!(device_id = %packet.device_id, error = %message, "failed to ingest packet");
            }
        }
    }
}

pub async fn bind_udp(port: u16) -> Result<UdpSocket> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    UdpSocket::bind(addr)
        .await
        .with_context(|| format!("Failed to bind telemetry socket on {addr}"))
}

/// Receives datagrams until cancelled. Each datagram is handled on its own task, so packets from
/// different devices are processed concurrently and unordered.
pub async fn run_receiver(
    socket: UdpSocket,
    handler: Arc<PacketHandler>,
    cancel: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = socket.local_addr() {
        tracing::info!(addr = %addr, "telemetry receiver listening");
    }
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("telemetry receiver stopping");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        tracing::warn!(error = %err, "telemetry socket receive failed");
                        continue;
                    }
                };
                let payload = buf[..len].to_vec();
                let handler = handler.clone();
                tokio::spawn(async move {
                    handler.process_datagram(&payload, Some(peer)).await;
                });
            }
        }
    }
}
