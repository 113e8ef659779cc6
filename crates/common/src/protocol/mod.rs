// Wire protocol: endpoint names, required headers, framing and message bodies.

pub mod frame;
pub mod messages;

/// Header carrying the target project for every endpoint except LATEST_CHANGES.
pub const PROJECT_ID_HEADER: &str = "x-project-id";
/// Header carrying the client's snapshot checksum for the same endpoints.
pub const SNAPSHOT_CHECKSUM_HEADER: &str = "x-snapshot-checksum";

/// Logical endpoints exposed per project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Commit,
    Head,
    AllChanges,
    LatestChanges,
    Squash,
    /// Materialized document at a requested revision.
    Document,
}

impl Endpoint {
    pub const ALL: [Endpoint; 6] =
        [Self::Commit, Self::Head, Self::AllChanges, Self::LatestChanges, Self::Squash, Self::Document];

    pub const fn path(self) -> &'static str {
        match self {
            Self::Commit => "/history/commit",
            Self::Head => "/history/head",
            Self::AllChanges => "/history/changes/all",
            Self::LatestChanges => "/history/changes/latest",
            Self::Squash => "/history/squash",
            Self::Document => "/history/document",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|endpoint| endpoint.path() == path)
    }

    /// Whether the request must carry project and snapshot-checksum headers.
    pub const fn requires_project_headers(self) -> bool {
        !matches!(self, Self::LatestChanges)
    }

    pub const fn is_write(self) -> bool {
        matches!(self, Self::Commit | Self::Squash)
    }
}

pub const LOGIN_PATH: &str = "/session/login";
pub const LOGOUT_PATH: &str = "/session/logout";
pub const PAUSE_PATH: &str = "/admin/pause";
pub const RESUME_PATH: &str = "/admin/resume";
