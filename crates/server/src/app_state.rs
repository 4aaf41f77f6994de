use crate::{api::ApiContext, auth::JwtVerifier};
use realtime::RealtimeContext;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) realtime: RealtimeContext,
    pub(crate) verifier: JwtVerifier,
    pub(crate) outbox_capacity: usize,
}
