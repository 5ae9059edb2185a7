//! 访问控制接口
//!
//! 同步核心只消费「当前授权的权限组」与「当前允许的语言」，
//! 具体的权限规则计算由嵌入方完成。

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::document::{GroupId, LanguageCode};

pub trait AccessControl: Send + Sync + std::fmt::Debug {
    /// 对某文档类型拥有指定操作权限的权限组
    fn accessible_groups(&self, doc_type: &str, permission: &str) -> Vec<GroupId>;

    /// 当前允许同步的语言
    fn permitted_languages(&self) -> Vec<LanguageCode>;
}

/// 快照式访问控制：权限变化时由调用方整体替换
#[derive(Debug, Default)]
pub struct StaticAccessControl {
    inner: RwLock<AccessSnapshot>,
}

#[derive(Debug, Clone, Default)]
struct AccessSnapshot {
    /// 所有类型通用的权限组
    groups: Vec<GroupId>,
    /// 按 (文档类型, 操作) 覆盖的权限组
    overrides: HashMap<(String, String), Vec<GroupId>>,
    languages: Vec<LanguageCode>,
}

impl StaticAccessControl {
    pub fn new<G, L>(groups: G, languages: L) -> Self
    where
        G: IntoIterator,
        G::Item: Into<GroupId>,
        L: IntoIterator,
        L::Item: Into<LanguageCode>,
    {
        let access = Self::default();
        access.set_groups(groups);
        access.set_languages(languages);
        access
    }

    pub fn set_groups<G>(&self, groups: G)
    where
        G: IntoIterator,
        G::Item: Into<GroupId>,
    {
        self.inner.write().groups = groups.into_iter().map(Into::into).collect();
    }

    pub fn set_languages<L>(&self, languages: L)
    where
        L: IntoIterator,
        L::Item: Into<LanguageCode>,
    {
        self.inner.write().languages = languages.into_iter().map(Into::into).collect();
    }

    pub fn set_groups_for(&self, doc_type: &str, permission: &str, groups: Vec<GroupId>) {
        self.inner
            .write()
            .overrides
            .insert((doc_type.to_string(), permission.to_string()), groups);
    }
}

impl AccessControl for StaticAccessControl {
    fn accessible_groups(&self, doc_type: &str, permission: &str) -> Vec<GroupId> {
        let inner = self.inner.read();
        inner
            .overrides
            .get(&(doc_type.to_string(), permission.to_string()))
            .cloned()
            .unwrap_or_else(|| inner.groups.clone())
    }

    fn permitted_languages(&self) -> Vec<LanguageCode> {
        self.inner.read().languages.clone()
    }
}
