pub mod cluster;
pub mod error;
pub mod eval;
pub mod hregex;
pub mod index;
pub mod input;
pub mod labeling;
pub mod lattice;

pub mod prelude {
    pub use crate::cluster::{ClusterConfig, DistanceMeasure, HierarchicalClustering, IntentInfo};
    pub use crate::error::FlowspecError;
    pub use crate::hregex::{HRegex, HRegexElement, HRegexLabeling};
    pub use crate::index::RTreeIndex;
    pub use crate::labeling::{
        ComponentLabeling, ComponentValue, DValue, DValueLabeling, Feature, FlowTuple,
        HierarchyLabeling, Ipv4Prefix, Ipv4PrefixLabeling, LabelId, Labeling, Spec, TupleLabeling,
    };
    pub use crate::lattice::MeetSemiLattice;
}

pub use cluster::{ClusterConfig, HierarchicalClustering, IntentInfo};
pub use error::FlowspecError;
pub use labeling::{Feature, Labeling, Spec};
