//! # 数据模型
//!
//! 分布式任务框架的核心数据结构：任务（Task）、步骤（Step）、子任务（Subtask）
//! 以及节点（NodeInfo）。三者分别对应存储层的三张逻辑表：
//!
//! - 任务表：按任务 key 唯一，记录类型、当前步骤、状态、owner 及其 epoch
//! - 子任务表：按 `(task_id, step, ordinal)` 唯一，记录执行节点、claim token、重试次数
//! - 节点表：按 exec_id 唯一，记录心跳时间与节点 epoch
//!
//! ## 任务状态流转
//! ```text
//! Pending → Running → Succeeded
//!              ↓  ↘
//!          Pausing  Reverting → Reverted
//!              ↓         ↓
//!           Paused     Failed
//!              ↓
//!          Resuming → Running
//!
//! 任意非终态 → Cancelling → Reverting / Cancelled
//! ```
//!
//! 所有状态字段使用枚举，以大写字符串形式持久化。

/// 为持久化为 TEXT 列的状态枚举实现 SQLite 编解码
macro_rules! impl_sqlite_text_enum {
    ($ty:ty) => {
        impl sqlx::Type<sqlx::Sqlite> for $ty {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <str as sqlx::Type<sqlx::Sqlite>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $ty {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                s.parse::<$ty>().map_err(|e| e.into())
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
            }
        }
    };
}

pub(crate) use impl_sqlite_text_enum;

pub mod node;
pub mod status;
pub mod step;
pub mod subtask;
pub mod task;

pub use node::*;
pub use status::*;
pub use step::*;
pub use subtask::*;
pub use task::*;
