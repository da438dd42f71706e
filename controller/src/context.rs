use crate::config::Config;
use crate::store::StoreError;

/// Context shared by both reconcilers: the persistence seam and the startup
/// configuration.
pub struct Data<S> {
    pub store: S,
    pub config: Config,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("failed to get object: {0}")]
    GetFailed(#[source] StoreError),

    #[error("failed to update object: {0}")]
    UpdateFailed(#[source] StoreError),

    #[error("failed to update status: {0}")]
    StatusUpdateFailed(#[source] StoreError),

    #[error("failed to create instance: {0}")]
    InstanceCreateFailed(#[source] StoreError),

    #[error("failed to delete instance: {0}")]
    InstanceDeleteFailed(#[source] StoreError),

    #[error("failed to create pod: {0}")]
    PodCreateFailed(#[source] StoreError),

    #[error("failed to delete pod: {0}")]
    PodDeleteFailed(#[source] StoreError),
}
