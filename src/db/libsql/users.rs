use async_trait::async_trait;
use chrono::Utc;
use libsql::params;
use uuid::Uuid;

use crate::db::{CreateUserParams, UpdateUserParams, UserRecord, UserStore};
use crate::error::DatabaseError;

use super::{LibSqlBackend, fmt_ts, get_opt_text, get_text, opt_text, parse_timestamp, parse_uuid};

const USER_COLUMNS: &str = "id, email, password_hash, name, avatar_url, created_at, last_login_at";

fn row_to_user_record(row: &libsql::Row) -> Result<UserRecord, DatabaseError> {
    Ok(UserRecord {
        id: parse_uuid(&get_text(row, 0), "user.id")?,
        email: get_text(row, 1),
        password_hash: get_text(row, 2),
        name: get_text(row, 3),
        avatar_url: get_opt_text(row, 4),
        created_at: parse_timestamp(&get_text(row, 5))?,
        last_login_at: get_opt_text(row, 6)
            .map(|raw| parse_timestamp(&raw))
            .transpose()?,
    })
}

impl LibSqlBackend {
    async fn fetch_user(
        &self,
        conn: &libsql::Connection,
        id: &str,
    ) -> Result<Option<UserRecord>, DatabaseError> {
        let mut rows = conn
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_user_record(&row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl UserStore for LibSqlBackend {
    async fn create_user(&self, input: &CreateUserParams) -> Result<UserRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO users (id, email, password_hash, name, avatar_url, created_at, last_login_at) \
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, NULL)",
            params![
                id.as_str(),
                input.email.as_str(),
                input.password_hash.as_str(),
                input.name.as_str(),
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;

        self.fetch_user(&conn, &id)
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created user".to_string()))
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<UserRecord>, DatabaseError> {
        let conn = self.connect().await?;
        self.fetch_user(&conn, &id.to_string()).await
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                params![email],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_user_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn record_login(&self, id: Uuid) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "UPDATE users SET last_login_at = ?2 WHERE id = ?1",
            params![id.to_string(), fmt_ts(&Utc::now())],
        )
        .await?;
        Ok(())
    }

    async fn update_user(
        &self,
        id: Uuid,
        input: &UpdateUserParams,
    ) -> Result<Option<UserRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let id = id.to_string();
        conn.execute(
            "UPDATE users SET \
               name = COALESCE(?2, name), \
               avatar_url = COALESCE(?3, avatar_url) \
             WHERE id = ?1",
            params![
                id.as_str(),
                opt_text(input.name.as_deref()),
                opt_text(input.avatar_url.as_deref()),
            ],
        )
        .await?;
        self.fetch_user(&conn, &id).await
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{CreateUserParams, UpdateUserParams, UserStore};
    use crate::error::DatabaseError;
    use crate::testing::setup_backend;

    fn params(email: &str) -> CreateUserParams {
        CreateUserParams {
            email: email.to_string(),
            password_hash: "pbkdf2-sha256$1$c2FsdA$aGFzaA".to_string(),
            name: "Ada".to_string(),
        }
    }

    #[tokio::test]
    async fn create_and_lookup_user() {
        let fixture = setup_backend().await;
        let db = &fixture.backend;

        let user = db.create_user(&params("ada@example.com")).await.expect("create");
        assert_eq!(user.email, "ada@example.com");
        assert!(user.last_login_at.is_none());

        let by_id = db.get_user(user.id).await.expect("get").expect("present");
        assert_eq!(by_id, user);
        let by_email = db
            .get_user_by_email("ada@example.com")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(by_email.id, user.id);

        db.record_login(user.id).await.expect("login");
        let after = db.get_user(user.id).await.expect("get").expect("present");
        assert!(after.last_login_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_email_is_a_constraint_error() {
        let fixture = setup_backend().await;
        let db = &fixture.backend;
        db.create_user(&params("dup@example.com")).await.expect("first");
        let err = db.create_user(&params("dup@example.com")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)), "{err:?}");
    }

    #[tokio::test]
    async fn update_keeps_unset_fields() {
        let fixture = setup_backend().await;
        let db = &fixture.backend;
        let user = db.create_user(&params("upd@example.com")).await.expect("create");

        let updated = db
            .update_user(
                user.id,
                &UpdateUserParams {
                    name: None,
                    avatar_url: Some("https://cdn.example.com/a.png".to_string()),
                },
            )
            .await
            .expect("update")
            .expect("present");
        assert_eq!(updated.name, "Ada");
        assert_eq!(updated.avatar_url.as_deref(), Some("https://cdn.example.com/a.png"));

        let missing = db
            .update_user(uuid::Uuid::new_v4(), &UpdateUserParams::default())
            .await
            .expect("update");
        assert!(missing.is_none());
    }
}
