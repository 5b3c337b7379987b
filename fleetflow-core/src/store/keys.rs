//! Object store key layout.

use fleetflow_model::{ClientId, FlowId, HuntId, RequestId};
use uuid::Uuid;

pub const FLOWS: &str = "flows";
pub const HUNTS: &str = "hunts";

pub fn flow(id: FlowId) -> String {
    format!("{FLOWS}/{id}")
}

/// Sequence numbers are zero padded so listing order is numeric order.
/// Each commit writes under its own batch id.
pub fn flow_result(id: FlowId, seq: u64, batch: Uuid) -> String {
    format!("{FLOWS}/{id}/results/{seq:020}/{batch}")
}

pub fn flow_inbox(id: FlowId) -> String {
    format!("{FLOWS}/{id}/inbox")
}

pub fn flow_inbox_entry(id: FlowId, request: RequestId) -> String {
    format!("{FLOWS}/{id}/inbox/{}", request.to_key())
}

pub fn flow_output_plugins(id: FlowId) -> String {
    format!("{FLOWS}/{id}/output_plugins")
}

pub fn flow_output_plugin(id: FlowId, instance: &str) -> String {
    format!("{FLOWS}/{id}/output_plugins/{instance}")
}

pub fn flow_lease(id: FlowId) -> String {
    format!("leases/flows/{id}")
}

pub fn hunt(id: HuntId) -> String {
    format!("{HUNTS}/{id}")
}

pub fn throttle(client: &ClientId, fingerprint: &str) -> String {
    format!("throttle/{client}/{fingerprint}")
}

pub fn client_flows(client: &ClientId) -> String {
    format!("clients/{client}/flows")
}

pub fn client_flow(client: &ClientId, id: FlowId) -> String {
    format!("clients/{client}/flows/{id}")
}
