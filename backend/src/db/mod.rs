pub mod provider_billing;
pub mod subscription_history;
pub mod subscription_plans;
