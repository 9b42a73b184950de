//! 数据模型模块
//! 组织树、角色继承、审批矩阵与审批流

pub mod flow;
pub mod matrix;
pub mod organization;
pub mod role;
