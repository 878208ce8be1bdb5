// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Migration transport negotiation and index header framing.
//!
//! Before any volume bytes flow, the source sends a length-delimited JSON
//! index header carrying the pool, volume and snapshot configs; the
//! receiver acknowledges with a response frame that may override `refresh`
//! (notably forcing it off when the target volume does not exist yet).
//! The transfer method itself is negotiated from the ordered preference
//! lists both drivers report.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::{
    storage::{backup, drivers::ContentType},
    vessel::{VesselError, VesselResult},
};

/// Version of the index header protocol spoken by this build. Version 0
/// means no header is exchanged.
pub const INDEX_HEADER_VERSION: u32 = 1;

/// Largest frame accepted on the control channel.
const MAX_FRAME_LEN: u32 = 16 << 20;

/// A bidirectional byte stream a migration runs over: the in-process pipe
/// pair for same-host copies, or a cross-host connection supplied by the
/// cluster layer.
pub trait MigrationConn: Read + Write {}

impl<T> MigrationConn for T where T: Read + Write {}

/// Wire protocol for moving volume payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Generic file-tree stream, usable between any two drivers.
    GenericFs,
    /// Generic raw block stream, usable between any two drivers.
    GenericBlock,
    /// Driver-specific optimized stream; both sides must share the driver.
    Optimized,
}

/// A transport method offer: a protocol plus the feature set both sides
/// must agree on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationType {
    pub protocol: Protocol,
    #[serde(default)]
    pub features: Vec<String>,
}

impl MigrationType {
    pub fn new(protocol: Protocol) -> MigrationType {
        MigrationType {
            protocol,
            features: Vec::new(),
        }
    }
}

/// The method used when the peer offered nothing usable: raw block for
/// block content, the generic file stream otherwise.
pub fn fallback_migration_type(content_type: ContentType) -> MigrationType {
    match content_type {
        ContentType::Block | ContentType::Iso => MigrationType::new(Protocol::GenericBlock),
        ContentType::Fs => MigrationType::new(Protocol::GenericFs),
    }
}

/// Compute the usable transfer methods from the sender's ordered offer and
/// the receiver's accept set. Offers are preferred in the order the sender
/// listed them; the features of a matched method are the intersection of
/// both sides'. An empty offer falls back to the content-type fallback if
/// the receiver accepts it.
pub fn match_types(
    offer: &[MigrationType],
    fallback: MigrationType,
    accept: &[MigrationType],
) -> VesselResult<Vec<MigrationType>> {
    if offer.is_empty() {
        if accept.iter().any(|t| t.protocol == fallback.protocol) {
            return Ok(vec![fallback]);
        }

        return Err(VesselError::Msg(
            "No migration types offered and fallback type not accepted".to_string(),
        ));
    }

    let matches: Vec<MigrationType> = offer
        .iter()
        .filter_map(|offered| {
            accept
                .iter()
                .find(|ours| ours.protocol == offered.protocol)
                .map(|ours| MigrationType {
                    protocol: offered.protocol,
                    features: offered
                        .features
                        .iter()
                        .filter(|f| ours.features.contains(f))
                        .cloned()
                        .collect(),
                })
        })
        .collect();

    if matches.is_empty() {
        return Err(VesselError::Msg(format!(
            "No matching migration types found in offer {offer:?}"
        )));
    }

    Ok(matches)
}

/// The index header: the source's backup config (pool, volume and ordered
/// snapshot configs).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Info {
    pub config: backup::Config,
}

/// Receiver's acknowledgement of the index header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Receiver's override of the refresh flag; `false` when the target
    /// volume does not exist yet.
    #[serde(default)]
    pub refresh: Option<bool>,
}

impl InfoResponse {
    pub fn err(&self) -> Option<VesselError> {
        if self.success {
            None
        } else {
            Some(VesselError::Msg(
                self.error
                    .clone()
                    .unwrap_or_else(|| "Migration peer reported failure".to_string()),
            ))
        }
    }
}

/// Arguments controlling the source side of a volume transfer.
#[derive(Debug, Clone, Default)]
pub struct VolumeSourceArgs {
    pub name: String,
    /// Snapshot-only names to send, oldest first.
    pub snapshots: Vec<String>,
    pub migration_type: Option<MigrationType>,
    pub allow_inconsistent: bool,
    /// Send incremental streams against an existing target volume.
    pub refresh: bool,
    /// Final sync of a live cluster move; snapshots must not be sent.
    pub final_sync: bool,
    pub volume_only: bool,
    /// Set when moving a volume between cluster members on shared storage.
    pub cluster_move_source_name: Option<String>,
    pub info: Option<Info>,
    pub index_header_version: u32,
}

/// Arguments controlling the target side of a volume transfer.
#[derive(Debug, Clone, Default)]
pub struct VolumeTargetArgs {
    pub name: String,
    pub description: String,
    /// Snapshot-only names expected, oldest first.
    pub snapshots: Vec<String>,
    pub migration_type: Option<MigrationType>,
    pub refresh: bool,
    pub volume_only: bool,
    /// Block volume provisioning floor carried in the offer header, so the
    /// target device is at least as large as the source.
    pub volume_size: Option<u64>,
    pub cluster_move_source_name: Option<String>,
    pub config: Option<std::collections::HashMap<String, String>>,
    pub index_header_version: u32,
}

/// Write one length-delimited frame.
pub fn write_frame(conn: &mut dyn MigrationConn, payload: &[u8]) -> VesselResult<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| VesselError::Msg("Frame too large".to_string()))?;
    conn.write_all(&len.to_be_bytes())?;
    conn.write_all(payload)?;
    conn.flush()?;
    Ok(())
}

/// Read one length-delimited frame.
pub fn read_frame(conn: &mut dyn MigrationConn) -> VesselResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    conn.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(VesselError::Msg(format!("Frame of {len} bytes too large")));
    }

    let mut payload = vec![0u8; len as usize];
    conn.read_exact(&mut payload)?;
    Ok(payload)
}

/// Send the migration index header and wait for the receiver's response.
pub fn send_index_header(
    version: u32,
    conn: &mut dyn MigrationConn,
    info: &Info,
) -> VesselResult<InfoResponse> {
    if version == 0 {
        return Ok(InfoResponse {
            success: true,
            error: None,
            refresh: None,
        });
    }

    let payload = serde_json::to_vec(info)?;
    write_frame(conn, &payload)
        .map_err(|err| VesselError::wrap("Failed sending migration index header", err))?;
    debug!("Sent migration index header, waiting for response");

    let resp_payload = read_frame(conn)
        .map_err(|err| VesselError::wrap("Failed reading migration index header response", err))?;
    let resp: InfoResponse = serde_json::from_slice(&resp_payload)?;

    if let Some(err) = resp.err() {
        return Err(VesselError::wrap("Failed negotiating migration options", err));
    }

    debug!("Received migration index header response: {resp:?}");
    Ok(resp)
}

/// Receive the migration index header and acknowledge it, communicating the
/// (possibly caller-revised) refresh flag back to the source.
pub fn receive_index_header(
    version: u32,
    conn: &mut dyn MigrationConn,
    refresh: bool,
) -> VesselResult<Option<Info>> {
    if version == 0 {
        return Ok(None);
    }

    debug!("Waiting for migration index header");
    let payload = read_frame(conn)
        .map_err(|err| VesselError::wrap("Failed reading migration index header", err))?;
    let info: Info = serde_json::from_slice(&payload)?;

    let resp = InfoResponse {
        success: true,
        error: None,
        refresh: Some(refresh),
    };
    let resp_payload = serde_json::to_vec(&resp)?;
    write_frame(conn, &resp_payload)
        .map_err(|err| VesselError::wrap("Failed sending migration index header response", err))?;

    debug!("Sent migration index header response");
    Ok(Some(info))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crate::storage::structures::{pipe_pair, Cancel};

    use super::*;

    #[test]
    /// Matching prefers the offer's order and intersects features.
    fn match_prefers_offer_order() {
        let offer = vec![
            MigrationType {
                protocol: Protocol::Optimized,
                features: vec!["compress".into(), "delta".into()],
            },
            MigrationType::new(Protocol::GenericFs),
        ];
        let accept = vec![
            MigrationType::new(Protocol::GenericFs),
            MigrationType {
                protocol: Protocol::Optimized,
                features: vec!["compress".into()],
            },
        ];

        let matched = match_types(
            &offer,
            fallback_migration_type(ContentType::Fs),
            &accept,
        )
        .unwrap();
        assert_eq!(matched[0].protocol, Protocol::Optimized);
        assert_eq!(matched[0].features, vec!["compress".to_string()]);
        assert_eq!(matched[1].protocol, Protocol::GenericFs);
    }

    #[test]
    /// An empty offer uses the content-type fallback when acceptable.
    fn empty_offer_falls_back() {
        let accept = vec![MigrationType::new(Protocol::GenericBlock)];
        let matched = match_types(
            &[],
            fallback_migration_type(ContentType::Block),
            &accept,
        )
        .unwrap();
        assert_eq!(matched, vec![MigrationType::new(Protocol::GenericBlock)]);
    }

    #[test]
    /// Disjoint offer and accept sets are an error.
    fn disjoint_sets_error() {
        let offer = vec![MigrationType::new(Protocol::Optimized)];
        let accept = vec![MigrationType::new(Protocol::GenericFs)];
        assert_matches!(
            match_types(&offer, fallback_migration_type(ContentType::Fs), &accept),
            Err(VesselError::Msg(_))
        );
    }

    mod prop {
        use proptest::prelude::*;

        use super::*;

        fn arb_types() -> impl Strategy<Value = Vec<MigrationType>> {
            proptest::collection::vec(
                proptest::sample::select(vec![
                    Protocol::GenericFs,
                    Protocol::GenericBlock,
                    Protocol::Optimized,
                ])
                .prop_map(MigrationType::new),
                0..4,
            )
        }

        proptest! {
            #[test]
            /// Every negotiated method was both offered and accepted, and
            /// the first match follows the offer's preference order.
            fn negotiation_is_sound(offer in arb_types(), accept in arb_types()) {
                let fallback = fallback_migration_type(ContentType::Fs);

                match match_types(&offer, fallback.clone(), &accept) {
                    Ok(matched) => {
                        prop_assert!(!matched.is_empty());
                        for m in &matched {
                            if offer.is_empty() {
                                prop_assert_eq!(m.protocol, fallback.protocol);
                            } else {
                                prop_assert!(offer.iter().any(|o| o.protocol == m.protocol));
                            }
                            prop_assert!(accept.iter().any(|a| a.protocol == m.protocol));
                        }

                        if let Some(first_usable) = offer
                            .iter()
                            .find(|o| accept.iter().any(|a| a.protocol == o.protocol))
                        {
                            prop_assert_eq!(matched[0].protocol, first_usable.protocol);
                        }
                    }
                    Err(_) => {
                        // Only legitimate when nothing overlaps.
                        prop_assert!(offer
                            .iter()
                            .all(|o| !accept.iter().any(|a| a.protocol == o.protocol)));
                    }
                }
            }
        }
    }

    #[test]
    /// The index header round-trips over a pipe pair and the receiver's
    /// refresh override reaches the sender.
    fn index_header_round_trip() {
        let cancel = Cancel::new();
        let (mut a, mut b) = pipe_pair(&cancel);

        let sender = thread::spawn(move || {
            send_index_header(INDEX_HEADER_VERSION, &mut a, &Info::default())
        });

        let received = receive_index_header(INDEX_HEADER_VERSION, &mut b, false)
            .unwrap()
            .unwrap();
        assert_eq!(received.config, backup::Config::default());

        let resp = sender.join().unwrap().unwrap();
        assert_eq!(resp.refresh, Some(false));
    }
}
