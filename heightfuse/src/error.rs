use thiserror::Error;

/// A raw reading which can not be turned into a `SourceEstimate`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MalformedEstimateError {
    #[error("missing or invalid location")]
    Location,

    #[error("unparseable height {0:?}")]
    Height(String),

    #[error("negative height {0}")]
    NegativeHeight(f64),

    #[error("unparseable accuracy {0:?}")]
    Accuracy(String),
}

#[derive(Error, Debug)]
pub enum FuseError {
    /// Fusion was asked to process a cluster without members. Clusters
    /// produced by the matcher always have at least one, so this is a
    /// bug in the caller.
    #[error("cluster has no members")]
    EmptyCluster,

    #[error("no cluster member reports a height")]
    NoHeight,

    #[error("cluster has {0} members, limit is {1}")]
    ClusterTooLarge(usize, usize),

    #[error("invalid configuration parameter '{0}'")]
    Config(&'static str),

    #[error("{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
