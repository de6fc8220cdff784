use {
    burrow_common::{Error, Result, time::now_ms},
    serde::{Deserialize, Serialize},
    sqlx::SqlitePool,
};

/// What a profile carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    /// A git credential token.
    Credential,
    /// `KEY=VALUE` lines exported into the sandbox environment.
    Env,
    /// Commands run once after init completes.
    StartupCommand,
}

impl ProfileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Credential => "credential",
            Self::Env => "env",
            Self::StartupCommand => "startup_command",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credential" => Some(Self::Credential),
            "env" => Some(Self::Env),
            "startup_command" => Some(Self::StartupCommand),
            _ => None,
        }
    }
}

/// A reusable blob referenced by id from container records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub kind: ProfileKind,
    pub payload: String,
    pub created_at_ms: u64,
}

/// SQLite persistence for credential / env / startup-command profiles.
pub struct ProfileStore {
    pool: SqlitePool,
}

impl ProfileStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS profiles (
                id         TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                kind       TEXT NOT NULL,
                payload    TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn create(&self, name: &str, kind: ProfileKind, payload: &str) -> Result<Profile> {
        if name.trim().is_empty() {
            return Err(Error::validation("profile name cannot be empty"));
        }
        let profile = Profile {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            kind,
            payload: payload.to_string(),
            created_at_ms: now_ms(),
        };
        sqlx::query("INSERT INTO profiles (id, name, kind, payload, created_at) VALUES (?, ?, ?, ?, ?)")
            .bind(&profile.id)
            .bind(&profile.name)
            .bind(profile.kind.as_str())
            .bind(&profile.payload)
            .bind(profile.created_at_ms as i64)
            .execute(&self.pool)
            .await?;
        Ok(profile)
    }

    pub async fn get(&self, id: &str) -> Result<Profile> {
        let row = sqlx::query_as::<_, ProfileRow>("SELECT * FROM profiles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ProfileRow::into_profile)
            .transpose()?
            .ok_or_else(|| Error::not_found(format!("profile {id} not found")))
    }

    pub async fn list(&self, kind: Option<ProfileKind>) -> Result<Vec<Profile>> {
        let rows = match kind {
            Some(k) => {
                sqlx::query_as::<_, ProfileRow>(
                    "SELECT * FROM profiles WHERE kind = ? ORDER BY name",
                )
                .bind(k.as_str())
                .fetch_all(&self.pool)
                .await?
            },
            None => {
                sqlx::query_as::<_, ProfileRow>("SELECT * FROM profiles ORDER BY kind, name")
                    .fetch_all(&self.pool)
                    .await?
            },
        };
        rows.into_iter().map(ProfileRow::into_profile).collect()
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM profiles WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("profile {id} not found")));
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ProfileRow {
    id: String,
    name: String,
    kind: String,
    payload: String,
    created_at: i64,
}

impl ProfileRow {
    fn into_profile(self) -> Result<Profile> {
        let kind = ProfileKind::parse(&self.kind)
            .ok_or_else(|| Error::message(format!("unknown profile kind '{}'", self.kind)))?;
        Ok(Profile {
            id: self.id,
            name: self.name,
            kind,
            payload: self.payload,
            created_at_ms: self.created_at as u64,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn crud_round_trip() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        ProfileStore::init(&pool).await.unwrap();
        let store = ProfileStore::new(pool);

        let p = store
            .create("gh-token", ProfileKind::Credential, "ghp_abc")
            .await
            .unwrap();
        assert_eq!(store.get(&p.id).await.unwrap().payload, "ghp_abc");
        assert_eq!(
            store.list(Some(ProfileKind::Credential)).await.unwrap().len(),
            1
        );
        assert!(store.list(Some(ProfileKind::Env)).await.unwrap().is_empty());

        store.delete(&p.id).await.unwrap();
        assert!(matches!(
            store.get(&p.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
