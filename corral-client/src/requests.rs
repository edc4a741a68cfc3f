//! Request lifecycle endpoints

use crate::StoreClient;
use crate::error::Result;
use corral_core::domain::Request;
use corral_core::dto::request::{CreateRequest, SetPriority};
use uuid::Uuid;

impl StoreClient {
    // =============================================================================
    // Request Lifecycle
    // =============================================================================

    /// Create a Request, committing it too when `req.commit` is set
    ///
    /// # Arguments
    /// * `req` - The request creation payload
    ///
    /// # Returns
    /// The stored Request
    pub async fn create_request(&self, req: CreateRequest) -> Result<Request> {
        let url = format!("{}/requests", self.base_url);
        let response = self.client.post(&url).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// Get a Request by ID
    pub async fn get_request(&self, id: Uuid) -> Result<Request> {
        let url = format!("{}/requests/{}", self.base_url, id);
        self.retry
            .run("get request", || async {
                let response = self.client.get(&url).send().await?;
                self.handle_response(response).await
            })
            .await
    }

    /// Commit an Uncommitted Request
    pub async fn commit_request(&self, id: Uuid) -> Result<Request> {
        let url = format!("{}/requests/{}/commit", self.base_url, id);
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }

    /// Change a Request's priority
    ///
    /// # Arguments
    /// * `id` - The Request UUID
    /// * `priority` - New non-negative priority
    pub async fn set_priority(&self, id: Uuid, priority: i64) -> Result<Request> {
        let url = format!("{}/requests/{}/priority", self.base_url, id);
        let response = self
            .client
            .post(&url)
            .json(&SetPriority { priority })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Cancel a Request
    pub async fn cancel_request(&self, id: Uuid) -> Result<Request> {
        let url = format!("{}/requests/{}/cancel", self.base_url, id);
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }
}
