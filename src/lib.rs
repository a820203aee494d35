//! disttask 节点进程：日志与指标初始化、关闭信号处理

pub mod shutdown;
pub mod telemetry;
