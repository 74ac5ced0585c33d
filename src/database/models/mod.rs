pub mod employee;
pub mod organization;
pub mod user;

pub use employee::Employee;
pub use organization::{Organization, ProvisionedOrganization};
pub use user::UserAccount;
