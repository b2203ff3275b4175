//! Upstream notifications emitted toward the control layer.

use renderer_types::RendererState;

/// Events the facade/engine publish to whatever control layer is
/// attached. Emission never happens while engine locks are held, so a
/// subscriber may call straight back into the facade.
#[derive(Clone, Debug)]
pub enum RendererEvent {
    StateChanged(RendererState),
    TrackChanged {
        track_number: u32,
        uri: String,
        metadata: String,
    },
    PositionTick {
        position_seconds: u64,
        duration_seconds: u64,
    },
}
