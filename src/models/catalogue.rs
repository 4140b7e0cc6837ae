use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order_line::OrderLine;

/// Products a sale or a specific-product voucher applies to. A line matches
/// when its product, variant, category or any of its collections is listed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalogue {
    #[serde(default)]
    pub product_ids: Vec<Uuid>,
    #[serde(default)]
    pub variant_ids: Vec<Uuid>,
    #[serde(default)]
    pub collection_ids: Vec<Uuid>,
    #[serde(default)]
    pub category_ids: Vec<Uuid>,
}

impl Catalogue {
    pub fn matches(&self, line: &OrderLine) -> bool {
        line.product_id.map_or(false, |id| self.product_ids.contains(&id))
            || line.variant_id.map_or(false, |id| self.variant_ids.contains(&id))
            || line.category_id.map_or(false, |id| self.category_ids.contains(&id))
            || line
                .collection_ids
                .iter()
                .any(|id| self.collection_ids.contains(id))
    }

    pub fn is_empty(&self) -> bool {
        self.product_ids.is_empty()
            && self.variant_ids.is_empty()
            && self.collection_ids.is_empty()
            && self.category_ids.is_empty()
    }
}
