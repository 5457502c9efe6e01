use clap::{Args, Subcommand};
use config_store::filter::FilterError;
use config_store::resolver::{DeepMerge, PathHierarchy, ScopeResolver, ScopedConfig};
use config_store::store::{Pagination, SortBy, SortField};
use config_store::types::DEFAULT_CONTEXT;
use config_store::{
    ConfigResource, ConfigStore, FilterExpression, QueryOptions, RequestContext, StoreError,
};
use serde::Serialize;
use serde_json::Value;
use std::io::Write;

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid filter: {0}")]
    Filter(#[from] FilterError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("could not write output: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} not found")]
    NotFound(String),
}

#[derive(Args, Debug, Clone)]
pub struct ResourceArgs {
    /// Tenant owning the config
    #[arg(long)]
    pub tenant: String,
    #[arg(long)]
    pub namespace: String,
    #[arg(long)]
    pub resource: String,
}

impl ResourceArgs {
    fn resource(&self) -> ConfigResource {
        ConfigResource::new(
            self.resource.as_str(),
            self.namespace.as_str(),
            self.tenant.as_str(),
        )
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the latest version of a config
    Get {
        #[command(flatten)]
        resource: ResourceArgs,
        /// Omit for the singleton config of the resource
        #[arg(long, default_value = "")]
        context: String,
        /// Merge the default context with these contexts instead, later ones winning
        #[arg(long = "merge", conflicts_with = "context")]
        merge: Vec<String>,
    },
    /// Write a new version of a config
    Put {
        #[command(flatten)]
        resource: ResourceArgs,
        #[arg(long, default_value = "")]
        context: String,
        /// Config value as JSON
        #[arg(long)]
        value: String,
        /// Only write if the current version matches this JSON filter
        #[arg(long = "if")]
        precondition: Option<String>,
    },
    /// Delete a config, keeping its history
    Delete {
        #[command(flatten)]
        resource: ResourceArgs,
        #[arg(long, default_value = "")]
        context: String,
    },
    /// List the latest config of every context
    List {
        #[command(flatten)]
        resource: ResourceArgs,
        /// JSON filter over the config values
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        /// Sort by this path inside the config instead of creation time
        #[arg(long)]
        sort_path: Option<String>,
    },
    /// Resolve effective configs over contexts named as scope paths
    Resolve {
        #[command(flatten)]
        resource: ResourceArgs,
        /// Scope to resolve; resolves every stored scope when omitted
        #[arg(long)]
        scope: Option<String>,
        #[arg(long, default_value_t = '/')]
        separator: char,
    },
}

fn print<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<(), CommandError> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

pub async fn execute<W: Write>(
    store: &ConfigStore,
    ctx: &RequestContext,
    command: Command,
    out: &mut W,
) -> Result<(), CommandError> {
    match command {
        Command::Get {
            resource,
            context,
            merge,
        } => {
            if !merge.is_empty() {
                let merged = store.read_merged(ctx, &resource.resource(), &merge).await?;
                return match merged {
                    Some(merged) => print(out, &merged),
                    None => Err(CommandError::NotFound(resource.resource().to_string())),
                };
            }
            let key = resource.resource().context(context);
            match store.read(ctx, &key).await? {
                Some(record) => print(out, &record),
                None => Err(CommandError::NotFound(key.to_string())),
            }
        }
        Command::Put {
            resource,
            context,
            value,
            precondition,
        } => {
            let value: Value = serde_json::from_str(&value)?;
            let precondition = precondition
                .as_deref()
                .map(FilterExpression::from_json)
                .transpose()?;
            let key = resource.resource().context(context);
            let result = store.write(ctx, &key, value, precondition.as_ref()).await?;
            tracing::info!(key = %key, version = result.record.version, "Config written");
            print(out, &result)
        }
        Command::Delete { resource, context } => {
            let key = resource.resource().context(context);
            match store.delete(ctx, &key).await? {
                Some(deleted) => {
                    tracing::info!(key = %key, version = deleted.version, "Config deleted");
                    print(out, &deleted)
                }
                None => Err(CommandError::NotFound(key.to_string())),
            }
        }
        Command::List {
            resource,
            filter,
            limit,
            offset,
            sort_path,
        } => {
            let options = QueryOptions {
                filter: filter
                    .as_deref()
                    .map(FilterExpression::from_json)
                    .transpose()?,
                pagination: Some(Pagination { limit, offset }),
                sort_by: sort_path
                    .map(|path| SortBy {
                        field: SortField::Path(path),
                        order: Default::default(),
                    })
                    .into_iter()
                    .collect(),
            };
            let result = store.query(ctx, &resource.resource(), &options).await?;
            print(out, &result)
        }
        Command::Resolve {
            resource,
            scope,
            separator,
        } => {
            let result = store
                .query(ctx, &resource.resource(), &QueryOptions::default())
                .await?;

            let mut default = None;
            let mut records = Vec::with_capacity(result.records.len());
            for record in result.records {
                if record.context() == DEFAULT_CONTEXT {
                    default = Some(record.value);
                } else {
                    records.push(ScopedConfig {
                        scope: record.key.context,
                        data: record.value,
                    });
                }
            }

            let mut resolver = ScopeResolver::new(PathHierarchy { separator }, DeepMerge);
            if let Some(default) = default {
                resolver = resolver.with_default(default);
            }
            match scope {
                Some(scope) => match resolver.resolve(&records, &scope) {
                    Some(resolved) => print(out, &resolved),
                    None => Err(CommandError::NotFound(scope)),
                },
                None => print(out, &resolver.resolve_all(&records)),
            }
        }
    }
}
