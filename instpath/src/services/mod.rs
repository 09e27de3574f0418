// Jackson Coxson

#[cfg(feature = "installation_proxy")]
pub mod installation_proxy;
pub mod lockdown;
