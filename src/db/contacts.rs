use anyhow::Result;
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite};
use tracing::instrument;

use super::Pool;
use crate::model::Contact;

const COLUMNS: &str = "id, company_id, name, email, phone, title, is_primary, created_at";

#[derive(Debug, Clone)]
pub struct NewContact {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub title: Option<String>,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ContactChanges {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub title: Option<String>,
    pub is_primary: Option<bool>,
}

/// Inserts a contact; a primary contact demotes the company's other contacts.
#[instrument(skip_all)]
pub async fn insert(pool: &Pool, company_id: i64, c: &NewContact) -> Result<Contact> {
    let mut tx = pool.begin().await?;
    if c.is_primary {
        sqlx::query("UPDATE contacts SET is_primary = 0 WHERE company_id = ?")
            .bind(company_id)
            .execute(&mut *tx)
            .await?;
    }
    let row = sqlx::query_as::<_, Contact>(&format!(
        "INSERT INTO contacts (company_id, name, email, phone, title, is_primary, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING {COLUMNS}"
    ))
    .bind(company_id)
    .bind(&c.name)
    .bind(&c.email)
    .bind(&c.phone)
    .bind(&c.title)
    .bind(c.is_primary)
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row)
}

pub async fn get(pool: &Pool, id: i64) -> Result<Option<Contact>> {
    let row = sqlx::query_as::<_, Contact>(&format!("SELECT {COLUMNS} FROM contacts WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn list_by_company(pool: &Pool, company_id: i64) -> Result<Vec<Contact>> {
    let rows = sqlx::query_as::<_, Contact>(&format!(
        "SELECT {COLUMNS} FROM contacts WHERE company_id = ? ORDER BY is_primary DESC, name COLLATE NOCASE"
    ))
    .bind(company_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn update(pool: &Pool, id: i64, ch: &ContactChanges) -> Result<Option<Contact>> {
    let mut tx = pool.begin().await?;
    if ch.is_primary == Some(true) {
        sqlx::query(
            "UPDATE contacts SET is_primary = 0 \
             WHERE company_id = (SELECT company_id FROM contacts WHERE id = ?) AND id != ?",
        )
        .bind(id)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    }
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE contacts SET id = id");
    if let Some(name) = &ch.name {
        qb.push(", name = ").push_bind(name.clone());
    }
    if let Some(email) = &ch.email {
        qb.push(", email = ").push_bind(email.clone());
    }
    if let Some(phone) = &ch.phone {
        qb.push(", phone = ").push_bind(phone.clone());
    }
    if let Some(title) = &ch.title {
        qb.push(", title = ").push_bind(title.clone());
    }
    if let Some(primary) = ch.is_primary {
        qb.push(", is_primary = ").push_bind(primary);
    }
    qb.push(" WHERE id = ").push_bind(id);
    qb.push(format!(" RETURNING {COLUMNS}"));
    let row = qb
        .build_query_as::<Contact>()
        .fetch_optional(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(row)
}

pub async fn delete(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM contacts WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::companies::{self, NewCompany};
    use crate::db::memory_pool;
    use crate::model::{CompanyStatus, PlanTier};

    fn contact(name: &str, primary: bool) -> NewContact {
        NewContact {
            name: name.into(),
            email: format!("{}@example.com", name.to_lowercase()),
            phone: None,
            title: None,
            is_primary: primary,
        }
    }

    #[tokio::test]
    async fn only_one_primary_contact_per_company() {
        let pool = memory_pool().await.unwrap();
        let company = companies::insert(
            &pool,
            &NewCompany {
                name: "Acme".into(),
                status: CompanyStatus::Active,
                plan_tier: PlanTier::Starter,
                active_request_limit: 1,
                billing_email: None,
                woo_customer_id: None,
                woo_subscription_id: None,
            },
        )
        .await
        .unwrap();

        let first = insert(&pool, company.id, &contact("Ann", true)).await.unwrap();
        let second = insert(&pool, company.id, &contact("Bob", true)).await.unwrap();
        assert!(!get(&pool, first.id).await.unwrap().unwrap().is_primary);
        assert!(second.is_primary);

        update(
            &pool,
            first.id,
            &ContactChanges {
                is_primary: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        let all = list_by_company(&pool, company.id).await.unwrap();
        let primaries: Vec<_> = all.iter().filter(|c| c.is_primary).map(|c| c.id).collect();
        assert_eq!(primaries, vec![first.id]);
    }
}
