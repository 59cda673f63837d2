use parley_api::{ApiClient, HistoryQuery, HistoryRecord};
use parley_protocol::ConversationRef;
use parley_session::{BoxFuture, HistorySource, PersistedTurn, SessionError, SessionResult};

/// Serves history refreshes from `/api/history`.
pub struct ApiHistory {
    client: ApiClient,
    limit: u32,
}

impl ApiHistory {
    pub fn new(client: ApiClient, limit: u32) -> Self {
        Self { client, limit }
    }
}

impl HistorySource for ApiHistory {
    fn fetch_history(
        &self,
        conversation: ConversationRef,
    ) -> BoxFuture<'static, SessionResult<Vec<PersistedTurn>>> {
        let client = self.client.clone();
        let query = HistoryQuery::for_conversation(conversation.clone(), self.limit);
        Box::pin(async move {
            let records = client
                .fetch_history(&query)
                .await
                .map_err(|error| SessionError::History {
                    stage: "fetch-history",
                    message: error.to_string(),
                })?;
            Ok(records
                .into_iter()
                .map(|record| persisted_turn(record, &conversation))
                .collect())
        })
    }
}

fn persisted_turn(record: HistoryRecord, requested: &ConversationRef) -> PersistedTurn {
    PersistedTurn {
        record_id: record.id,
        conversation: record.conversation().unwrap_or_else(|| requested.clone()),
        user_input: record.user_input.unwrap_or_default(),
        ai_response: record.ai_response.unwrap_or_default(),
    }
}
