//! gRPC plugin adapter: the `DataSource` implementation for an
//! out-of-process plugin instance, spec.md §9's "interface over
//! inheritance" note.

pub mod proto {
    tonic::include_proto!("plugin");
}

use crate::datasource::DataSource;
use crate::errors::{AppError, AppResult};
use crate::models::{Filter, MutateOperation, MutatePayload, Row};
use crate::schema::PhysicalSchema;
use async_trait::async_trait;
use proto::plugin_service_client::PluginServiceClient;
use serde_json::Value as JsonValue;
use tonic::transport::Channel;
use tokio::sync::Mutex as AsyncMutex;

pub struct GrpcPluginAdapter {
    biz_name: String,
    client: AsyncMutex<PluginServiceClient<Channel>>,
}

impl GrpcPluginAdapter {
    pub async fn connect(endpoint: String, biz_name: impl Into<String>) -> AppResult<Self> {
        let channel = Channel::from_shared(endpoint)
            .map_err(|e| AppError::Plugin {
                operation: "grpc_connect".to_string(),
                reason: e.to_string(),
            })?
            .connect()
            .await?;
        Ok(Self {
            biz_name: biz_name.into(),
            client: AsyncMutex::new(PluginServiceClient::new(channel)),
        })
    }
}

fn to_proto_filters(filters: &[Filter]) -> Vec<proto::Filter> {
    filters
        .iter()
        .map(|f| proto::Filter {
            field: f.field.clone(),
            value_json: f.value.to_string(),
            fuzzy: f.fuzzy,
            logic: f.logic.map(|l| l.as_sql().to_string()).unwrap_or_default(),
        })
        .collect()
}

#[async_trait]
impl DataSource for GrpcPluginAdapter {
    fn name(&self) -> &str {
        &self.biz_name
    }

    fn type_name(&self) -> &'static str {
        "grpc_plugin"
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> AppResult<i64> {
        let mut client = self.client.lock().await;
        let response = client
            .count(proto::CountRequest {
                table: table.to_string(),
                filters: to_proto_filters(filters),
            })
            .await?;
        Ok(response.into_inner().count)
    }

    async fn query(
        &self,
        table: &str,
        filters: &[Filter],
        fields: &[String],
        page: i64,
        size: i64,
    ) -> AppResult<Vec<Row>> {
        let mut client = self.client.lock().await;
        let response = client
            .query(proto::QueryRequest {
                table: table.to_string(),
                filters: to_proto_filters(filters),
                fields: fields.to_vec(),
                page,
                size,
            })
            .await?;
        let biz_name = self.biz_name.clone();
        response
            .into_inner()
            .rows_json
            .into_iter()
            .map(|row_json| {
                let mut row: Row = serde_json::from_str(&row_json)?;
                row.insert(
                    crate::models::LIB_MARKER.to_string(),
                    JsonValue::String(biz_name.clone()),
                );
                Ok(row)
            })
            .collect()
    }

    async fn mutate(&self, op: MutateOperation, payload: &MutatePayload) -> AppResult<i64> {
        let mut client = self.client.lock().await;
        let operation = match op {
            MutateOperation::Create => "create",
            MutateOperation::Update => "update",
            MutateOperation::Delete => "delete",
        };
        let data_json = payload
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?
            .unwrap_or_default();
        let response = client
            .mutate(proto::MutateRequest {
                operation: operation.to_string(),
                table: payload.table_name.clone(),
                data_json,
                filters: to_proto_filters(&payload.filters),
            })
            .await?;
        Ok(response.into_inner().rows_affected)
    }

    async fn get_schema(&self) -> AppResult<PhysicalSchema> {
        let mut client = self.client.lock().await;
        let response = client.get_schema(proto::SchemaRequest {}).await?;
        let json = response.into_inner().schema_json;
        #[derive(serde::Deserialize)]
        struct Wire {
            tables: std::collections::BTreeMap<String, Vec<String>>,
            default_table: Option<String>,
        }
        let wire: Wire = serde_json::from_str(&json)?;
        Ok(PhysicalSchema {
            tables: wire.tables,
            default_table: wire.default_table,
        })
    }

    async fn health_check(&self) -> AppResult<()> {
        let mut client = self.client.lock().await;
        let response = client.health_check(proto::HealthRequest {}).await?;
        if response.into_inner().healthy {
            Ok(())
        } else {
            Err(AppError::Unavailable {
                group: self.biz_name.clone(),
                lib: self.biz_name.clone(),
                reason: "plugin reported unhealthy".to_string(),
            })
        }
    }

    async fn close(&self) -> AppResult<()> {
        // The underlying transport channel is dropped with `self`; there
        // is no explicit disconnect RPC in the plugin contract.
        Ok(())
    }
}
