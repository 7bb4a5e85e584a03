use crate::model::feature_id::FeatureId;
use crate::model::pool::NodeAddress;
use crate::model::string_pool::StringId;

/// A named, directional link from a feature to another feature id, with
/// optional source/target validities and source-data references.
#[derive(Clone, Debug, PartialEq)]
pub struct Relation {
    pub name: StringId,
    pub target: FeatureId,
    pub source_validity: Option<NodeAddress>,
    pub target_validity: Option<NodeAddress>,
    pub source_data: Option<NodeAddress>,
}
