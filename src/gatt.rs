//! GATT service discovery and characteristic role assignment.
//!
//! Walks the peer's primary services and assigns the write, notify and
//! control-point roles across the two supported dialects: the FTMS service
//! first, then the legacy `fe00` / `fff0` services as fallbacks for any role
//! still unassigned.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    ble::{BleCharacteristic, BleSession},
    error::{Result, WalkPadError},
    uuid_util::uuid_match,
    FTMS_CONTROL_POINT_SHORT, FTMS_SERVICE_SHORT, FTMS_TREADMILL_DATA_SHORT,
};

/// Legacy service short ids, tried in order
const LEGACY_SERVICES: [&str; 2] = ["fe00", "fff0"];
/// Legacy write characteristic short ids
const LEGACY_WRITE_CHARS: [&str; 2] = ["fe01", "fff2"];
/// Legacy notify characteristic short ids
const LEGACY_NOTIFY_CHARS: [&str; 2] = ["fe02", "fff1"];

/// Characteristic roles assigned by discovery
pub struct GattRoles {
    /// UUIDs of every discovered primary service, long string form
    pub service_uuids: Vec<String>,
    /// Characteristic commands are written to
    pub write: Arc<dyn BleCharacteristic>,
    /// Characteristic status notifications arrive on
    pub notify: Arc<dyn BleCharacteristic>,
    /// FTMS control point, when the peer exposes one
    pub control_point: Option<Arc<dyn BleCharacteristic>>,
    /// Whether the control point also supports indications
    pub control_point_indicates: bool,
}

impl std::fmt::Debug for GattRoles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattRoles")
            .field("service_uuids", &self.service_uuids)
            .field("write", &self.write.uuid())
            .field("notify", &self.notify.uuid())
            .field("control_point", &self.control_point.as_ref().map(|c| c.uuid()))
            .field("control_point_indicates", &self.control_point_indicates)
            .finish()
    }
}

/// Discover characteristic roles on a freshly connected session.
///
/// On failure the session is disconnected before the error is returned, so
/// the peer is never left holding a half-configured connection.
///
/// # Errors
///
/// Returns [`WalkPadError::Discovery`] when no write or no notify
/// characteristic can be assigned across all services.
pub async fn discover_roles(session: &dyn BleSession) -> Result<GattRoles> {
    match assign_roles(session).await {
        Ok(roles) => Ok(roles),
        Err(e) => {
            if let Err(disconnect_err) = session.disconnect().await {
                warn!("disconnect after failed discovery also failed: {disconnect_err}");
            }
            Err(e)
        }
    }
}

async fn assign_roles(session: &dyn BleSession) -> Result<GattRoles> {
    let services = session.primary_services().await?;
    let mut service_uuids = Vec::with_capacity(services.len());

    let mut write: Option<Arc<dyn BleCharacteristic>> = None;
    let mut notify: Option<Arc<dyn BleCharacteristic>> = None;
    let mut control_point: Option<Arc<dyn BleCharacteristic>> = None;
    let mut control_point_indicates = false;

    for service in &services {
        let service_uuid = service.uuid();
        service_uuids.push(service_uuid.clone());

        if uuid_match(&service_uuid, FTMS_SERVICE_SHORT) {
            for ch in service.characteristics().await? {
                let props = ch.properties();
                if uuid_match(&ch.uuid(), FTMS_TREADMILL_DATA_SHORT) && props.notify {
                    notify = Some(ch);
                } else if uuid_match(&ch.uuid(), FTMS_CONTROL_POINT_SHORT) && props.writable() {
                    control_point_indicates = props.indicate;
                    write = Some(Arc::clone(&ch));
                    control_point = Some(ch);
                }
            }
        } else if (write.is_none() || notify.is_none())
            && LEGACY_SERVICES.iter().any(|&s| uuid_match(&service_uuid, s))
        {
            for ch in service.characteristics().await? {
                let props = ch.properties();
                let uuid = ch.uuid();
                if LEGACY_WRITE_CHARS.iter().any(|&c| uuid_match(&uuid, c)) && props.writable() {
                    write = Some(ch);
                } else if LEGACY_NOTIFY_CHARS.iter().any(|&c| uuid_match(&uuid, c)) && props.notify
                {
                    notify = Some(ch);
                }
            }
        }
    }

    match (write, notify) {
        (Some(write), Some(notify)) => {
            debug!(
                "assigned roles: write={}, notify={}, control_point={:?}",
                write.uuid(),
                notify.uuid(),
                control_point.as_ref().map(|c| c.uuid())
            );
            Ok(GattRoles {
                service_uuids,
                write,
                notify,
                control_point,
                control_point_indicates,
            })
        }
        (write, notify) => Err(WalkPadError::Discovery(format!(
            "missing characteristic roles (write: {}, notify: {}) across services {:?}",
            write.is_some(),
            notify.is_some(),
            service_uuids
        ))),
    }
}
