use regex::RegexSet;

/// Usernames common enough to be standing brute-force targets. Membership
/// contributes to the threat score of a login event; it does not block the
/// attempt by itself.
pub const COMMON_USERNAMES: &[&str] = &[
    "account",
    "adm",
    "admin",
    "admin1",
    "administrator",
    "author",
    "contributor",
    "demo",
    "editor",
    "guest",
    "manager",
    "hostname",
    "qwerty",
    "root",
    "seo",
    "support",
    "sysadmin",
    "test",
    "testuser",
    "user",
    "webmaster",
    "wordpress",
    "wpadmin",
];

/// Filenames that almost never appear in legitimate traffic: configuration
/// files, installers, and dropped shells.
const BAD_FILENAMES: &[&str] = &[
    "wp-config.php",
    "config.php",
    "configuration.php",
    "setup-config.php",
    "install.php",
    "phpinfo.php",
    "info.php",
    "shell.php",
    "cmd.php",
    "wso.php",
    "adminer.php",
    ".env",
    ".htaccess",
    ".htpasswd",
];

/// Extensions typical of backups and dumps left on a server.
const BAD_EXTENSIONS: &[&str] = &[
    "sql", "bak", "old", "orig", "save", "swp", "tar", "gz", "tgz", "zip", "rar", "7z", "ini",
    "sh", "bat", "cgi",
];

/// Attack markers looked for anywhere in a request URI.
const URI_MARKERS: &[&str] = &[
    r"(?i)wp-config",
    r"\.\./",
    r"(?i)etc/passwd",
    r"(?i)union\s+select",
    r"(?i)<script",
    r"(?i)%3c\s*script",
    r"(?i)base64_",
    r"(?i)eval\(",
    r"(?i)\.git/",
    r"(?i)phpmyadmin",
];

/// Stateless classifier mapping request identifiers to 0/1 score
/// contributions. The total score of an event is the sum of the applicable
/// components; any positive score sets the event's threat flag.
#[derive(Debug)]
pub struct ThreatScorer {
    blocked_usernames: Vec<String>,
    uri_markers: RegexSet,
}

impl ThreatScorer {
    pub fn new(block_list: &[String]) -> Result<Self, regex::Error> {
        Ok(Self {
            blocked_usernames: block_list.to_vec(),
            uri_markers: RegexSet::new(URI_MARKERS)?,
        })
    }

    /// Score a request filename against the known-bad name and extension sets.
    pub fn score_filename(&self, filename: &str) -> u8 {
        let name = filename.trim().to_lowercase();
        if name.is_empty() {
            return 0;
        }

        if BAD_FILENAMES.contains(&name.as_str()) {
            return 1;
        }

        if let Some((_, ext)) = name.rsplit_once('.') {
            if BAD_EXTENSIONS.contains(&ext) {
                return 1;
            }
        }

        0
    }

    /// Score a request URI against the attack-path markers.
    pub fn score_uri(&self, uri: &str) -> u8 {
        u8::from(self.uri_markers.is_match(uri))
    }

    /// Score a username: commonly abused names and the configured block list
    /// both count, case-insensitively.
    pub fn score_username(&self, username: &str) -> u8 {
        let name = username.trim().to_lowercase();
        if name.is_empty() {
            return 0;
        }

        let listed = COMMON_USERNAMES.contains(&name.as_str())
            || self.blocked_usernames.iter().any(|u| u == &name);

        u8::from(listed)
    }

    /// Whether a username is on the admin-configured hard-block list. The
    /// builtin common-username list only contributes to scoring, never blocks.
    pub fn is_blocked_username(&self, username: &str) -> bool {
        let name = username.trim().to_lowercase();
        !name.is_empty() && self.blocked_usernames.iter().any(|u| u == &name)
    }
}
