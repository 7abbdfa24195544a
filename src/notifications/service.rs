use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db::models::{AlertRow, NotificationRow, ProductRow, StoreRow};
use crate::error::Result;
use crate::notifications::email::{EmailTag, EmailTransport};
use crate::notifications::evaluator;
use crate::notifications::templates;
use crate::types::AlertType;

/// Suppress repeat notifications for the same (product, alert) inside this
/// window when the price has not moved a cent.
const DUPLICATE_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct NotificationResult {
    pub success: bool,
    pub notification_id: Option<i64>,
    pub error_message: Option<String>,
}

/// Fans triggered alerts out to the email channel with duplicate suppression
/// and PENDING → SENT/FAILED bookkeeping on the notifications table.
pub struct NotificationService {
    pool: SqlitePool,
    transport: Arc<dyn EmailTransport>,
    user_email: String,
}

impl NotificationService {
    pub fn new(pool: SqlitePool, transport: Arc<dyn EmailTransport>, user_email: String) -> Self {
        Self {
            pool,
            transport,
            user_email,
        }
    }

    // -----------------------------------------------------------------------
    // Duplicate suppression
    // -----------------------------------------------------------------------

    /// True when the last SENT notification for this (product, alert) within
    /// the window carried the same price to within one cent.
    pub async fn is_duplicate(
        &self,
        product_id: i64,
        alert_id: i64,
        current_price: f64,
    ) -> Result<bool> {
        let cutoff = Utc::now() - Duration::hours(DUPLICATE_WINDOW_HOURS);
        let last: Option<NotificationRow> = sqlx::query_as(
            "SELECT * FROM notifications
             WHERE product_id = ? AND alert_id = ? AND status = 'sent' AND created_at >= ?
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(product_id)
        .bind(alert_id)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        let Some(last) = last else {
            return Ok(false);
        };
        let last_price = last.payload_json().get("current_price").and_then(|p| p.as_f64());
        Ok(last_price.is_some_and(|p| (p - current_price).abs() < 0.01))
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn create_pending(
        &self,
        alert_id: Option<i64>,
        product_id: i64,
        payload: serde_json::Value,
    ) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO notifications (alert_id, product_id, channel, status, payload, created_at)
             VALUES (?, ?, 'email', 'pending', ?, ?)",
        )
        .bind(alert_id)
        .bind(product_id)
        .bind(payload.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    async fn mark_outcome(
        &self,
        notification_id: i64,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<()> {
        if success {
            sqlx::query("UPDATE notifications SET status = 'sent', sent_at = ? WHERE id = ?")
                .bind(Utc::now())
                .bind(notification_id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE notifications SET status = 'failed', error_message = ? WHERE id = ?")
                .bind(error_message)
                .bind(notification_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        alert_id: Option<i64>,
        product_id: i64,
        payload: serde_json::Value,
        rendered: templates::RenderedEmail,
        tags: Vec<EmailTag>,
    ) -> Result<NotificationResult> {
        if self.user_email.is_empty() {
            return Ok(NotificationResult {
                success: false,
                notification_id: None,
                error_message: Some("No user email configured".to_string()),
            });
        }

        let notification_id = self.create_pending(alert_id, product_id, payload).await?;

        let result = self
            .transport
            .send(
                &self.user_email,
                &rendered.subject,
                &rendered.html,
                Some(&rendered.text),
                &tags,
            )
            .await;

        self.mark_outcome(notification_id, result.success, result.error_message.as_deref())
            .await?;

        Ok(NotificationResult {
            success: result.success,
            notification_id: Some(notification_id),
            error_message: result.error_message,
        })
    }

    async fn store_name(&self, domain: &str) -> String {
        let name: Option<String> =
            sqlx::query_scalar("SELECT display_name FROM stores WHERE domain = ?")
                .bind(domain)
                .fetch_optional(&self.pool)
                .await
                .ok()
                .flatten();
        name.unwrap_or_else(|| domain.to_string())
    }

    pub async fn send_price_alert(
        &self,
        product: &ProductRow,
        alert: &AlertRow,
        previous_price: Option<f64>,
    ) -> Result<NotificationResult> {
        let current_price = product.current_price.unwrap_or_default();

        if self.is_duplicate(product.id, alert.id, current_price).await? {
            info!(
                product_id = product.id,
                alert_id = alert.id,
                price = current_price,
                "duplicate notification prevented"
            );
            return Ok(NotificationResult {
                success: false,
                notification_id: None,
                error_message: Some("Duplicate notification prevented".to_string()),
            });
        }

        let store_name = self.store_name(&product.store_domain).await;
        let label = match alert.alert_type {
            AlertType::TargetPrice => "Target Price Reached",
            AlertType::PercentDrop => "Price Drop",
            AlertType::AnyChange => "Price Changed",
            AlertType::BackInStock => "Back in Stock",
        };

        let rendered = templates::render_price_alert(
            &product.name,
            &store_name,
            current_price,
            previous_price,
            product.original_price,
            &product.url,
            label,
        );

        let payload = json!({
            "product_name": product.name,
            "current_price": current_price,
            "previous_price": previous_price,
            "alert_type": alert.alert_type.to_string(),
        });

        self.dispatch(
            Some(alert.id),
            product.id,
            payload,
            rendered,
            vec![
                EmailTag { name: "type".into(), value: "price_alert".into() },
                EmailTag { name: "product_id".into(), value: product.id.to_string() },
            ],
        )
        .await
    }

    pub async fn send_back_in_stock(
        &self,
        product: &ProductRow,
        alert: &AlertRow,
    ) -> Result<NotificationResult> {
        let current_price = product.current_price.unwrap_or_default();

        if self.is_duplicate(product.id, alert.id, current_price).await? {
            info!(
                product_id = product.id,
                alert_id = alert.id,
                "duplicate notification prevented"
            );
            return Ok(NotificationResult {
                success: false,
                notification_id: None,
                error_message: Some("Duplicate notification prevented".to_string()),
            });
        }

        let store_name = self.store_name(&product.store_domain).await;
        let rendered = templates::render_back_in_stock(
            &product.name,
            &store_name,
            current_price,
            &product.url,
        );

        let payload = json!({
            "product_name": product.name,
            "current_price": current_price,
            "alert_type": "back_in_stock",
        });

        self.dispatch(
            Some(alert.id),
            product.id,
            payload,
            rendered,
            vec![
                EmailTag { name: "type".into(), value: "back_in_stock".into() },
                EmailTag { name: "product_id".into(), value: product.id.to_string() },
            ],
        )
        .await
    }

    pub async fn send_product_error(
        &self,
        product: &ProductRow,
        error_type: &str,
        error_message: &str,
    ) -> Result<NotificationResult> {
        let store_name = self.store_name(&product.store_domain).await;
        let rendered = templates::render_product_error(
            &product.name,
            &store_name,
            error_type,
            error_message,
            &product.url,
        );

        let payload = json!({
            "product_name": product.name,
            "error_type": error_type,
            "error_message": error_message,
        });

        self.dispatch(
            None,
            product.id,
            payload,
            rendered,
            vec![
                EmailTag { name: "type".into(), value: "product_error".into() },
                EmailTag { name: "product_id".into(), value: product.id.to_string() },
            ],
        )
        .await
    }

    pub async fn send_store_flagged(
        &self,
        store: &StoreRow,
        products_affected: i64,
    ) -> Result<NotificationResult> {
        let rendered = templates::render_store_flagged(
            &store.display_name,
            &store.domain,
            store.success_rate,
            products_affected,
        );

        let payload = json!({
            "store_domain": store.domain,
            "store_name": store.display_name,
            "success_rate": store.success_rate,
            "products_affected": products_affected,
        });

        // Store-level notice: no product or alert association.
        self.dispatch(
            None,
            0,
            payload,
            rendered,
            vec![
                EmailTag { name: "type".into(), value: "store_flagged".into() },
                EmailTag { name: "store".into(), value: store.domain.clone() },
            ],
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Price-change pipeline
    // -----------------------------------------------------------------------

    /// Evaluate every live alert on a product against the fresh scrape and
    /// dispatch the triggered ones. Returns one result per triggered alert.
    pub async fn process_price_change(
        &self,
        product: &ProductRow,
        new_price: f64,
        new_in_stock: bool,
        old_price: Option<f64>,
        old_in_stock: Option<bool>,
    ) -> Result<Vec<NotificationResult>> {
        let alerts: Vec<AlertRow> = sqlx::query_as(
            "SELECT * FROM alerts
             WHERE product_id = ? AND active = 1 AND deleted_at IS NULL",
        )
        .bind(product.id)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::new();
        for alert in &alerts {
            let evaluation =
                evaluator::evaluate(alert, new_price, old_price, new_in_stock, old_in_stock);
            if !evaluation.triggered {
                continue;
            }

            info!(
                product_id = product.id,
                alert_id = alert.id,
                alert_type = %alert.alert_type,
                reason = %evaluation.reason,
                "alert triggered"
            );

            sqlx::query(
                "UPDATE alerts SET triggered = 1, triggered_at = ?, updated_at = ? WHERE id = ?",
            )
            .bind(Utc::now())
            .bind(Utc::now())
            .bind(alert.id)
            .execute(&self.pool)
            .await?;

            let result = if alert.alert_type == AlertType::BackInStock {
                self.send_back_in_stock(product, alert).await
            } else {
                self.send_price_alert(product, alert, old_price).await
            };

            match result {
                Ok(r) => results.push(r),
                Err(e) => {
                    warn!(alert_id = alert.id, "notification dispatch failed: {e}");
                    results.push(NotificationResult {
                        success: false,
                        notification_id: None,
                        error_message: Some(e.to_string()),
                    });
                }
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::products::{apply_scrape_success, insert_product, product_by_id};
    use crate::db::test_pool;
    use crate::notifications::email::testing::MockTransport;
    use crate::types::{ExtractionStrategy, NotificationStatus, ProductSnapshot};

    async fn setup(pool: &SqlitePool) -> (ProductRow, Arc<MockTransport>, NotificationService) {
        sqlx::query(
            "INSERT INTO stores (domain, display_name, created_at, updated_at)
             VALUES ('shop.ca', 'Shop Canada', ?, ?)",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();
        let product = insert_product(pool, "https://shop.ca/p/1", "shop.ca", "Stand Mixer Pro")
            .await
            .unwrap();

        let transport = Arc::new(MockTransport::default());
        let service = NotificationService::new(
            pool.clone(),
            transport.clone(),
            "buyer@example.com".to_string(),
        );
        (product, transport, service)
    }

    async fn insert_alert(
        pool: &SqlitePool,
        product_id: i64,
        alert_type: AlertType,
        target: Option<f64>,
    ) -> i64 {
        sqlx::query(
            "INSERT INTO alerts (product_id, alert_type, target_value, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(product_id)
        .bind(alert_type)
        .bind(target)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    fn snapshot(price: f64, in_stock: bool) -> ProductSnapshot {
        ProductSnapshot {
            name: Some("Stand Mixer Pro".to_string()),
            price: Some(price),
            currency: "CAD".to_string(),
            in_stock,
            strategy_used: Some(ExtractionStrategy::JsonLd),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn target_price_hit_sends_notification_with_payload() {
        let pool = test_pool().await;
        let (product, transport, service) = setup(&pool).await;
        insert_alert(&pool, product.id, AlertType::TargetPrice, Some(100.0)).await;

        // Product at $110 drops to $95.
        apply_scrape_success(&pool, &product, &snapshot(110.0, true), None, 50)
            .await
            .unwrap();
        let product = product_by_id(&pool, product.id).await.unwrap().unwrap();
        let outcome = apply_scrape_success(&pool, &product, &snapshot(95.0, true), None, 50)
            .await
            .unwrap();
        assert!(outcome.price_history_written);

        let product = product_by_id(&pool, product.id).await.unwrap().unwrap();
        let results = service
            .process_price_change(
                &product,
                outcome.new_price,
                outcome.new_in_stock,
                outcome.previous_price,
                Some(outcome.previous_in_stock),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].success);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.contains("95.00"));

        let row: NotificationRow =
            sqlx::query_as("SELECT * FROM notifications ORDER BY id DESC LIMIT 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(row.status, NotificationStatus::Sent);
        assert_eq!(
            row.payload_json().get("current_price").and_then(|p| p.as_f64()),
            Some(95.0)
        );

        let triggered: bool = sqlx::query_scalar("SELECT triggered FROM alerts LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(triggered);
    }

    #[tokio::test]
    async fn rescrape_at_same_price_is_suppressed_as_duplicate() {
        let pool = test_pool().await;
        let (product, transport, service) = setup(&pool).await;
        let alert_id = insert_alert(&pool, product.id, AlertType::TargetPrice, Some(100.0)).await;

        apply_scrape_success(&pool, &product, &snapshot(95.0, true), None, 50)
            .await
            .unwrap();
        let product = product_by_id(&pool, product.id).await.unwrap().unwrap();

        let alert: AlertRow = sqlx::query_as("SELECT * FROM alerts WHERE id = ?")
            .bind(alert_id)
            .fetch_one(&pool)
            .await
            .unwrap();

        let first = service
            .send_price_alert(&product, &alert, Some(110.0))
            .await
            .unwrap();
        assert!(first.success);

        // Rescraped at the same $95.00 within 24h: evaluator would trigger,
        // but the notifier suppresses.
        let second = service
            .send_price_alert(&product, &alert, Some(110.0))
            .await
            .unwrap();
        assert!(!second.success);
        assert_eq!(
            second.error_message.as_deref(),
            Some("Duplicate notification prevented")
        );
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn back_in_stock_sends_its_template_once() {
        let pool = test_pool().await;
        let (product, transport, service) = setup(&pool).await;
        insert_alert(&pool, product.id, AlertType::BackInStock, None).await;

        // Out of stock at $50, then back in stock at the same price.
        apply_scrape_success(&pool, &product, &snapshot(50.0, false), None, 50)
            .await
            .unwrap();
        let product = product_by_id(&pool, product.id).await.unwrap().unwrap();
        let outcome = apply_scrape_success(&pool, &product, &snapshot(50.0, true), None, 50)
            .await
            .unwrap();
        assert!(outcome.price_history_written); // stock flip alone writes history

        let product = product_by_id(&pool, product.id).await.unwrap().unwrap();
        let results = service
            .process_price_change(
                &product,
                outcome.new_price,
                outcome.new_in_stock,
                outcome.previous_price,
                Some(outcome.previous_in_stock),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].subject, "Back in Stock: Stand Mixer Pro");
    }

    #[tokio::test]
    async fn percent_drop_below_threshold_sends_nothing() {
        let pool = test_pool().await;
        let (product, transport, service) = setup(&pool).await;
        sqlx::query(
            "INSERT INTO alerts
             (product_id, alert_type, target_value, min_change_threshold, created_at, updated_at)
             VALUES (?, 'percent_drop', 5.0, 2.0, ?, ?)",
        )
        .bind(product.id)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();

        apply_scrape_success(&pool, &product, &snapshot(100.0, true), None, 50)
            .await
            .unwrap();
        let product = product_by_id(&pool, product.id).await.unwrap().unwrap();
        let outcome = apply_scrape_success(&pool, &product, &snapshot(99.0, true), None, 50)
            .await
            .unwrap();

        let product = product_by_id(&pool, product.id).await.unwrap().unwrap();
        let results = service
            .process_price_change(
                &product,
                outcome.new_price,
                outcome.new_in_stock,
                outcome.previous_price,
                Some(outcome.previous_in_stock),
            )
            .await
            .unwrap();

        assert!(results.is_empty());
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_transport_marks_notification_failed() {
        let pool = test_pool().await;
        let (product, _, _) = setup(&pool).await;
        let alert_id = insert_alert(&pool, product.id, AlertType::TargetPrice, Some(100.0)).await;

        apply_scrape_success(&pool, &product, &snapshot(95.0, true), None, 50)
            .await
            .unwrap();
        let product = product_by_id(&pool, product.id).await.unwrap().unwrap();
        let alert: AlertRow = sqlx::query_as("SELECT * FROM alerts WHERE id = ?")
            .bind(alert_id)
            .fetch_one(&pool)
            .await
            .unwrap();

        let failing = Arc::new(MockTransport {
            fail: true,
            ..Default::default()
        });
        let service =
            NotificationService::new(pool.clone(), failing, "buyer@example.com".to_string());

        let result = service
            .send_price_alert(&product, &alert, Some(110.0))
            .await
            .unwrap();
        assert!(!result.success);

        let row: NotificationRow =
            sqlx::query_as("SELECT * FROM notifications ORDER BY id DESC LIMIT 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(row.status, NotificationStatus::Failed);
        assert!(row.error_message.is_some());
    }
}
