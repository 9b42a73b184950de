//! 分级审批路由与组织角色继承引擎

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod realtime;
pub mod repository;
pub mod routes;
pub mod services;
pub mod telemetry;
