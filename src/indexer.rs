use tracing::debug;

use crate::db::models::ProductRow;
use crate::types::ProductSnapshot;

/// Sync hooks toward the external vector index. Calls are fire-and-forget:
/// the core never blocks or fails on index trouble, it only logs.
pub trait ProductIndex: Send + Sync {
    /// A product was scraped successfully; push the fresh document.
    fn index(&self, product: &ProductRow, snapshot: &ProductSnapshot);

    /// Metadata fields changed without affecting the embedded text.
    fn update_metadata(&self, product: &ProductRow, changed_fields: &[&str]);

    /// Name or brand changed; the document needs re-embedding.
    fn reembed(&self, product: &ProductRow);

    /// The product was soft-deleted.
    fn remove(&self, product_id: i64);
}

/// Default hook target when no index is wired: log and move on.
#[derive(Debug, Default)]
pub struct LoggingIndex;

impl ProductIndex for LoggingIndex {
    fn index(&self, product: &ProductRow, snapshot: &ProductSnapshot) {
        debug!(
            product_id = product.id,
            price = snapshot.price.unwrap_or_default(),
            "index update skipped (no index configured)"
        );
    }

    fn update_metadata(&self, product: &ProductRow, changed_fields: &[&str]) {
        debug!(
            product_id = product.id,
            fields = ?changed_fields,
            "metadata update skipped (no index configured)"
        );
    }

    fn reembed(&self, product: &ProductRow) {
        debug!(product_id = product.id, "re-embed skipped (no index configured)");
    }

    fn remove(&self, product_id: i64) {
        debug!(product_id, "index removal skipped (no index configured)");
    }
}
