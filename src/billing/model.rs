//! WooCommerce Subscriptions payloads (only the fields the portal reads).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingAddress {
    pub first_name: String,
    pub last_name: String,
    pub company: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub total: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    #[serde(default)]
    pub customer_id: i64,
    pub status: String,
    #[serde(default)]
    pub billing: BillingAddress,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub total: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub billing_period: String,
    #[serde(default)]
    pub next_payment_date_gmt: Option<String>,
}

impl Subscription {
    /// Display name for a company provisioned from this subscription.
    pub fn company_name(&self) -> String {
        let company = self.billing.company.trim();
        if !company.is_empty() {
            return company.to_string();
        }
        let person = format!(
            "{} {}",
            self.billing.first_name.trim(),
            self.billing.last_name.trim()
        );
        let person = person.trim();
        if person.is_empty() {
            format!("Subscription #{}", self.id)
        } else {
            person.to_string()
        }
    }

    /// Product id of the first line item; the plan is derived from it.
    pub fn plan_product_id(&self) -> Option<i64> {
        self.line_items.first().map(|li| li.product_id)
    }
}
