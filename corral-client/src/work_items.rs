//! Work Item endpoints

use async_trait::async_trait;
use corral_core::domain::{Event, WorkItem, WorkItemState};
use corral_core::dto::work_item::{ListWorkItemsQuery, LockRequest, RecordEvent, StateReport};
use corral_core::{StoreError, WorkItemApi};
use uuid::Uuid;

use crate::StoreClient;
use crate::error::Result;

impl StoreClient {
    /// List the diagnostic events of a Work Item
    pub async fn list_events(&self, id: Uuid) -> Result<Vec<Event>> {
        let url = format!("{}/work_items/{}/events", self.base_url, id);
        self.retry
            .run("list events", || async {
                let response = self.client.get(&url).send().await?;
                self.handle_response(response).await
            })
            .await
    }

    /// Ask the store for an immediate priority repair pass
    pub async fn force_sweep(&self) -> Result<()> {
        let url = format!("{}/sweep", self.base_url);
        let response = self.client.post(&url).send().await?;

        self.handle_empty_response(response).await
    }
}

#[async_trait]
impl WorkItemApi for StoreClient {
    async fn get_work_item(&self, id: Uuid) -> std::result::Result<WorkItem, StoreError> {
        let url = format!("{}/work_items/{}", self.base_url, id);
        let item = self
            .retry
            .run("get work item", || async {
                let response = self.client.get(&url).send().await?;
                self.handle_response(response).await
            })
            .await?;
        Ok(item)
    }

    async fn list_work_items(
        &self,
        states: &[WorkItemState],
    ) -> std::result::Result<Vec<WorkItem>, StoreError> {
        let url = format!("{}/work_items", self.base_url);
        let query = ListWorkItemsQuery::from_states(states);
        let items = self
            .retry
            .run("list work items", || async {
                let response = self.client.get(&url).query(&query).send().await?;
                self.handle_response(response).await
            })
            .await?;
        Ok(items)
    }

    async fn lock(&self, id: Uuid, identity: &str) -> std::result::Result<WorkItem, StoreError> {
        let url = format!("{}/work_items/{}/lock", self.base_url, id);
        let body = LockRequest {
            identity: identity.to_string(),
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(crate::ClientError::from)?;
        Ok(self.handle_response(response).await?)
    }

    async fn unlock(&self, id: Uuid, identity: &str) -> std::result::Result<WorkItem, StoreError> {
        let url = format!("{}/work_items/{}/unlock", self.base_url, id);
        let body = LockRequest {
            identity: identity.to_string(),
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(crate::ClientError::from)?;
        Ok(self.handle_response(response).await?)
    }

    async fn report_state(
        &self,
        id: Uuid,
        report: StateReport,
    ) -> std::result::Result<WorkItem, StoreError> {
        let url = format!("{}/work_items/{}/state", self.base_url, id);
        let response = self
            .client
            .post(&url)
            .json(&report)
            .send()
            .await
            .map_err(crate::ClientError::from)?;
        Ok(self.handle_response(response).await?)
    }

    async fn record_event(
        &self,
        id: Uuid,
        event: RecordEvent,
    ) -> std::result::Result<(), StoreError> {
        let url = format!("{}/work_items/{}/events", self.base_url, id);
        let response = self
            .client
            .post(&url)
            .json(&event)
            .send()
            .await
            .map_err(crate::ClientError::from)?;
        Ok(self.handle_empty_response(response).await?)
    }
}
