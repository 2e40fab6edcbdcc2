/// URL prefix under which content-addressed icon assets are served
pub const ICON_URL_PREFIX: &str = "/ico";

/// Liveness endpoint, answered independently of the discovery pipeline
pub const HEALTHCHECK_PATH: &str = "/_healthcheck";

/// Multipart field carrying an uploaded icon
pub const ICON_UPLOAD_FIELD: &str = "favicon";

/// Service hints hidden from the presentation view unless configured otherwise
pub const DEFAULT_IGNORE_LIST: &[&str] = &["upnp", "https-alt", "ajp13"];

/// Overlay keys owned by the reconciliation engine; not writable by users
pub const RESERVED_FIELDS: &[&str] = &["ip", "port", "firstSeen", "lastSeen", "openPorts"];

/// Well-known user-settable overlay keys
pub const FIELD_NAME: &str = "name";
pub const FIELD_FAVORITE: &str = "favorite";
pub const FIELD_HIDDEN: &str = "hidden";
pub const FIELD_ICON: &str = "icon";
