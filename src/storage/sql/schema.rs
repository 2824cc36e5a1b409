//! Numbered schema migrations.
//!
//! Migrations are linear and append-only: a released migration is never
//! edited, schema changes get a new number. Statements are written in
//! Postgres dialect and translated at apply time. A migration may be scoped
//! to a single flavor when a dialect needs special handling.

/// One schema migration.
pub struct Migration {
    pub num: u32,
    /// `None` applies everywhere; `Some(name)` restricts to one flavor.
    pub flavor: Option<&'static str>,
    pub stmts: &'static [&'static str],
}

/// Applied-migration bookkeeping. Created outside the numbered list so the
/// list itself can be recorded in it.
pub const MIGRATIONS_TABLE: &str = "create table if not exists migrations (
    num integer not null primary key,
    applied_at timestamptz not null
)";

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        num: 1,
        flavor: None,
        stmts: &[
            "create table client (
                id text not null primary key,
                secret text not null,
                redirect_uris bytea not null,
                trusted_peers bytea not null,
                public boolean not null,
                name text not null,
                logo_url text not null
            )",
            "create table auth_request (
                id text not null primary key,
                client_id text not null,
                response_types bytea not null,
                scopes bytea not null,
                redirect_uri text not null,
                nonce text not null,
                state text not null,
                force_approval_prompt boolean not null,
                logged_in boolean not null,
                claims bytea not null,
                connector_id text not null,
                connector_data bytea not null,
                expiry timestamptz not null,
                code_challenge text not null default '',
                code_challenge_method text not null default '',
                hmac_key bytea not null
            )",
            "create table auth_code (
                id text not null primary key,
                client_id text not null,
                scopes bytea not null,
                nonce text not null,
                redirect_uri text not null,
                claims bytea not null,
                connector_id text not null,
                connector_data bytea not null,
                expiry timestamptz not null,
                code_challenge text not null default '',
                code_challenge_method text not null default ''
            )",
            "create table refresh_token (
                id text not null primary key,
                token text not null,
                client_id text not null,
                scopes bytea not null,
                nonce text not null,
                claims bytea not null,
                connector_id text not null,
                connector_data bytea not null,
                created_at timestamptz not null,
                last_used timestamptz not null
            )",
            "create table password (
                email text not null primary key,
                hash bytea not null,
                username text not null,
                user_id text not null
            )",
            "create table offline_session (
                user_id text not null,
                conn_id text not null,
                refresh bytea not null,
                connector_data bytea not null,
                primary key (user_id, conn_id)
            )",
            "create table connector (
                id text not null primary key,
                \"type\" text not null,
                name text not null,
                resource_version text not null,
                config bytea not null
            )",
            "create table keys (
                id text not null primary key,
                signing_key bytea not null,
                verification_keys bytea not null,
                next_rotation timestamptz not null
            )",
        ],
    },
    // Refresh-secret rotation: retain the previous secret for the
    // reuse-overlap window.
    Migration {
        num: 2,
        flavor: None,
        stmts: &["alter table refresh_token
            add column obsolete_token text not null default ''"],
    },
    // RFC 8628 device authorization grant.
    Migration {
        num: 3,
        flavor: None,
        stmts: &[
            "create table device_request (
                user_code text not null primary key,
                device_code text not null,
                client_id text not null,
                client_secret text not null,
                scopes bytea not null,
                expiry timestamptz not null
            )",
            "create table device_token (
                device_code text not null primary key,
                status text not null,
                token bytea not null,
                expiry timestamptz not null,
                last_request timestamptz not null,
                poll_interval_seconds bigint not null,
                code_challenge text not null default '',
                code_challenge_method text not null default ''
            )",
        ],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_numbers_are_dense_and_ordered() {
        for (i, m) in MIGRATIONS.iter().enumerate() {
            assert_eq!(m.num, i as u32 + 1, "migration numbering must be linear");
            assert!(!m.stmts.is_empty());
        }
    }
}
