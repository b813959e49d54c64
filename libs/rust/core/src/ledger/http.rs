//! Ledger adapter speaking the command-header HTTP protocol.
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{parse_count, parse_records, InsertOutcome, Ledger, Policy, PolicyRecord, Query};
use crate::error::LedgerError;

pub const USER_AGENT: &str = "AnyLog/1.23";

pub struct HttpLedger {
    client: reqwest::Client,
    url: String,
    ledger_id: String,
}

impl HttpLedger {
    pub fn new(url: impl Into<String>, ledger_id: impl Into<String>) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, url: url.into(), ledger_id: ledger_id.into() })
    }

    pub fn url(&self) -> &str { &self.url }

    fn insert_command(&self) -> String {
        format!("blockchain insert where policy = !my_policy and local = true and blockchain = {}", self.ledger_id)
    }

    fn delete_command(&self, id: &str) -> String {
        format!("blockchain delete policy where id = {id} and local = true and blockchain = {}", self.ledger_id)
    }

    async fn post(&self, command: String, body: String) -> Result<(u16, String), LedgerError> {
        debug!(%command, "ledger post");
        let resp = self.client.post(&self.url)
            .header("Content-Type", "text/plain")
            .header("command", command)
            .body(body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        Ok((status, resp.text().await?))
    }

    async fn fetch(&self, command: String) -> Result<String, LedgerError> {
        debug!(%command, "ledger get");
        let resp = self.client.get(&self.url).header("command", command).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        if status != 200 {
            return Err(LedgerError::Status { status, body });
        }
        Ok(body)
    }
}

pub(crate) fn is_duplicate(message: &str) -> bool {
    message.to_ascii_lowercase().contains("duplicate object id")
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn insert(&self, policy: &Policy) -> Result<InsertOutcome, LedgerError> {
        let (status, message) = self.post(self.insert_command(), policy.body()).await?;
        Ok(match status {
            200 => InsertOutcome::Committed,
            _ if is_duplicate(&message) => InsertOutcome::Duplicate,
            _ => InsertOutcome::Rejected { status, message },
        })
    }

    async fn delete(&self, id: &str) -> Result<(), LedgerError> {
        let (status, body) = self.post(self.delete_command(id), String::new()).await?;
        if status != 200 {
            return Err(LedgerError::Status { status, body });
        }
        Ok(())
    }

    async fn get(&self, query: &Query) -> Result<Vec<PolicyRecord>, LedgerError> {
        parse_records(&self.fetch(query.to_command(false)).await?)
    }

    async fn count(&self, query: &Query) -> Result<usize, LedgerError> {
        parse_count(&self.fetch(query.to_command(true)).await?)
    }
}
