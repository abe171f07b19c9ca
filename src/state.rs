use crate::gauge::GaugeService;
use crate::receiver::PacketHandler;
use crate::redeem::RedeemService;
use crate::stats::IngestStats;
use axum::extract::FromRef;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub redeem: Arc<RedeemService>,
    pub handler: Arc<PacketHandler>,
    pub gauge: Arc<GaugeService>,
    pub stats: Arc<IngestStats>,
}

impl FromRef<AppState> for Arc<RedeemService> {
    fn from_ref(state: &AppState) -> Arc<RedeemService> {
        state.redeem.clone()
    }
}

impl FromRef<AppState> for Arc<IngestStats> {
    fn from_ref(state: &AppState) -> Arc<IngestStats> {
        state.stats.clone()
    }
}
