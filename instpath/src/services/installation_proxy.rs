//! iOS Installation Proxy Service Client
//!
//! Provides functionality for interacting with the installation_proxy service on iOS devices,
//! which answers queries about installed applications.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::{Idevice, IdeviceError, IdeviceService};

/// Client for interacting with the iOS installation proxy service
///
/// Only the `Lookup` command is spoken; installing and removing applications
/// is out of reach of this client.
#[derive(Debug)]
pub struct InstallationProxyClient {
    /// The underlying device connection with established installation_proxy service
    pub idevice: Idevice,
}

impl IdeviceService for InstallationProxyClient {
    /// Returns the installation proxy service name as registered with lockdownd
    fn service_name() -> &'static str {
        "com.apple.mobile.installation_proxy"
    }

    async fn from_stream(idevice: Idevice) -> Result<Self, IdeviceError> {
        Ok(Self::new(idevice))
    }
}

impl InstallationProxyClient {
    /// Attributes requested by the path lookups
    pub const PATH_ATTRIBUTES: [&'static str; 3] =
        ["CFBundleIdentifier", "CFBundleExecutable", "Path"];

    /// Creates a new installation proxy client from an existing device connection
    ///
    /// # Arguments
    /// * `idevice` - Pre-established device connection
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    /// Sends a `Lookup` command and returns its `LookupResult`
    ///
    /// # Arguments
    /// * `application_type` - "System", "User", "Any" (the default) ...
    /// * `bundle_identifiers` - Restricts the lookup to these bundle IDs
    /// * `return_attributes` - Restricts each entry to these attributes
    ///
    /// # Returns
    /// A HashMap mapping bundle identifiers to application information
    ///
    /// # Errors
    /// `ServiceError` if the proxy reports an error, `UnexpectedResponse` if the
    /// reply has no `LookupResult`
    pub async fn lookup(
        &mut self,
        application_type: Option<&str>,
        bundle_identifiers: Option<&[&str]>,
        return_attributes: Option<&[&str]>,
    ) -> Result<HashMap<String, plist::Dictionary>, IdeviceError> {
        let mut options = plist::Dictionary::new();
        options.insert(
            "ApplicationType".into(),
            application_type.unwrap_or("Any").into(),
        );
        if let Some(ids) = bundle_identifiers {
            options.insert("BundleIDs".into(), string_array(ids));
        }
        if let Some(attrs) = return_attributes {
            options.insert("ReturnAttributes".into(), string_array(attrs));
        }

        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "Lookup".into());
        req.insert("ClientOptions".into(), plist::Value::Dictionary(options));
        self.idevice.send_plist(req).await?;

        let mut res = self.idevice.read_plist().await?;
        match res.remove("LookupResult") {
            Some(plist::Value::Dictionary(res)) => Ok(res
                .into_iter()
                .filter_map(|(id, info)| match info {
                    plist::Value::Dictionary(d) => Some((id, d)),
                    _ => {
                        warn!("Lookup entry for {id} is not a dictionary");
                        None
                    }
                })
                .collect()),
            _ => {
                warn!("Lookup reply has no LookupResult");
                Err(IdeviceError::UnexpectedResponse)
            }
        }
    }

    /// Retrieves information about installed applications
    ///
    /// # Arguments
    /// * `application_type` - Optional filter for application type:
    ///   - "System" for system applications
    ///   - "User" for user-installed applications
    ///   - "Any" for all applications (default)
    /// * `bundle_identifiers` - Optional list of specific bundle IDs to query
    pub async fn get_apps(
        &mut self,
        application_type: Option<&str>,
        bundle_identifiers: Option<&[&str]>,
    ) -> Result<HashMap<String, plist::Dictionary>, IdeviceError> {
        self.lookup(application_type, bundle_identifiers, None).await
    }

    /// Gets the on-device bundle path of an installed application
    ///
    /// # Returns
    /// The `Path` attribute exactly as the device reports it, e.g.
    /// `/private/var/containers/Bundle/Application/<UUID>/App.app`
    ///
    /// # Errors
    /// `AppNotFound` if nothing is installed under `bundle_id`,
    /// `ServiceError` if the proxy reports an error
    pub async fn get_path_for_bundle_identifier(
        &mut self,
        bundle_id: &str,
    ) -> Result<String, IdeviceError> {
        let info = self.app_info(bundle_id).await?;
        let path = non_empty_string(&info, "Path")
            .ok_or_else(|| IdeviceError::AppNotFound(bundle_id.to_string()))?;
        debug!("{bundle_id} lives at {path}");
        Ok(path.to_string())
    }

    /// Gets the path of an installed application's main executable,
    /// `Path/CFBundleExecutable`
    ///
    /// # Errors
    /// Same as [`Self::get_path_for_bundle_identifier`], and `AppNotFound` if
    /// the bundle declares no executable
    pub async fn get_executable_path_for_bundle_identifier(
        &mut self,
        bundle_id: &str,
    ) -> Result<String, IdeviceError> {
        let info = self.app_info(bundle_id).await?;
        match (
            non_empty_string(&info, "Path"),
            non_empty_string(&info, "CFBundleExecutable"),
        ) {
            (Some(path), Some(exe)) => Ok(format!("{}/{exe}", path.trim_end_matches('/'))),
            _ => Err(IdeviceError::AppNotFound(bundle_id.to_string())),
        }
    }

    async fn app_info(&mut self, bundle_id: &str) -> Result<plist::Dictionary, IdeviceError> {
        let mut apps = self
            .lookup(
                Some("Any"),
                Some(&[bundle_id][..]),
                Some(&Self::PATH_ATTRIBUTES[..]),
            )
            .await?;
        apps.remove(bundle_id)
            .ok_or_else(|| IdeviceError::AppNotFound(bundle_id.to_string()))
    }
}

fn string_array(items: &[&str]) -> plist::Value {
    plist::Value::Array(items.iter().map(|s| (*s).into()).collect())
}

fn non_empty_string<'a>(info: &'a plist::Dictionary, key: &str) -> Option<&'a str> {
    info.get(key)
        .and_then(|v| v.as_string())
        .filter(|s| !s.is_empty())
}
