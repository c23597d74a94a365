//! 请求/响应头部过滤
//!
//! 规则直接作用于头部值的原始字节，未被规则触及的字节原样保留。
use super::message::Headers;
use crate::config::{FilterAction, FilterScope, HeaderFilterConfig};
use crate::error::{ProxyError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use regex::bytes::Regex;

/// 编译后的单条过滤规则
#[derive(Debug, Clone)]
pub struct HeaderFilter {
    scope: FilterScope,
    action: FilterAction,
    name: String,
    value: String,
    edit: Option<(Regex, String)>,
}

impl HeaderFilter {
    pub fn compile(config: &HeaderFilterConfig) -> Result<Self> {
        let edit = match config.action {
            FilterAction::Edit | FilterAction::EditAll => {
                let regex = Regex::new(&config.value).map_err(|e| {
                    ProxyError::config(format!("invalid regex for '{}': {}", config.name, e))
                })?;
                Some((regex, config.replace.clone().unwrap_or_default()))
            }
            _ => None,
        };
        Ok(Self {
            scope: config.scope,
            action: config.action,
            name: config.name.clone(),
            value: config.value.clone(),
            edit,
        })
    }

    pub fn scope(&self) -> FilterScope {
        self.scope
    }

    pub fn apply(&self, headers: &mut Headers) {
        match self.action {
            FilterAction::Set => headers.insert(&self.name, &self.value),
            FilterAction::Add => headers.append(&self.name, &self.value),
            FilterAction::Unset => {
                headers.remove(&self.name);
            }
            FilterAction::Append => self.append_to_first(headers),
            FilterAction::Merge => {
                let present = headers
                    .get_all_raw(&self.name)
                    .flat_map(|v| v.split(|&b| b == b','))
                    .any(|t| t.trim_ascii() == self.value.as_bytes());
                if !present {
                    self.append_to_first(headers);
                }
            }
            FilterAction::Edit | FilterAction::EditAll => {
                let Some((regex, replace)) = &self.edit else {
                    return;
                };
                let all = self.action == FilterAction::EditAll;
                for value in headers.values_mut(&self.name) {
                    let edited = if all {
                        regex.replace_all(&value[..], replace.as_bytes()).into_owned()
                    } else {
                        regex.replace(&value[..], replace.as_bytes()).into_owned()
                    };
                    *value = Bytes::from(edited);
                }
            }
        }
    }

    fn append_to_first(&self, headers: &mut Headers) {
        match headers.first_mut(&self.name) {
            Some(existing) => {
                let mut joined = BytesMut::with_capacity(existing.len() + 2 + self.value.len());
                joined.put_slice(&existing[..]);
                joined.put_slice(b", ");
                joined.put_slice(self.value.as_bytes());
                *existing = joined.freeze();
            }
            None => headers.append(&self.name, &self.value),
        }
    }
}

/// 一个服务的全部过滤规则，按配置顺序应用
#[derive(Debug, Clone, Default)]
pub struct HeaderFilters {
    filters: Vec<HeaderFilter>,
}

impl HeaderFilters {
    pub fn compile(configs: &[HeaderFilterConfig]) -> Result<Self> {
        Ok(Self {
            filters: configs
                .iter()
                .map(HeaderFilter::compile)
                .collect::<Result<Vec<_>>>()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn apply(&self, scope: FilterScope, headers: &mut Headers) {
        for filter in self.filters.iter().filter(|f| f.scope() == scope) {
            filter.apply(headers);
        }
    }
}
