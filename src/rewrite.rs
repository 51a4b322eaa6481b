//! Pure URL rewriting for package metadata.
//!
//! Archive URLs from the known forge hosts and Git clone URLs are rewritten
//! to point at this mirror's archive gateway; SVN URLs pass through
//! untouched; anything else collapses to the mirror base URL. Both rewriters
//! leave URLs that already point at the mirror unchanged, so rewriting is
//! idempotent.

use std::sync::LazyLock;

use regex::Regex;

static GITHUB_ARCHIVE: LazyLock<Regex> = LazyLock::new(|| {
    // The `api.` prefix is stripped by matching after it, so the captured
    // host is the clone host (`api.github.com` -> `github.com`).
    Regex::new(r"^https?://api\.([\w.-]+)/repos/([\w.-]+)/([\w.-]+)/zipball/(\w+)$")
        .expect("github archive regex")
});

static BITBUCKET_ARCHIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://([\w.-]+)/([\w-]+)/([\w.-]+)/get/(\w+)\.zip$")
        .expect("bitbucket archive regex")
});

static GITLAB_ARCHIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://([\w.-]+)/([\w-]+)/([\w.-]+)/repository/archive\.zip\?ref=(\w+)$")
        .expect("gitlab archive regex")
});

static GIT_REPOSITORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?:git|https?)://|git@)(?:[\w.-]+@)?(?P<host>[\w.-]+)[/:](?P<path>[\w./-]+?)(?:\.git)?$",
    )
    .expect("git repository regex")
});

static SVN_REPOSITORY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^svn://|\.svn\.").expect("svn repository regex"));

/// Rewrite a source-archive URL to this mirror's archive gateway.
///
/// Recognises GitHub zipball, Bitbucket `get`, and GitLab `archive.zip`
/// URLs; all three become `<mirror>/git/<host>/<vendor>/<project>/<ref>.zip`.
/// Unrecognised URLs are stripped down to the mirror base.
pub fn rewrite_archive_url(mirror: &str, url: &str) -> String {
    if url.starts_with(mirror) {
        return url.to_string();
    }

    for pattern in [&*GITHUB_ARCHIVE, &*BITBUCKET_ARCHIVE, &*GITLAB_ARCHIVE] {
        if let Some(caps) = pattern.captures(url) {
            return format!(
                "{mirror}/git/{}/{}/{}/{}.zip",
                &caps[1], &caps[2], &caps[3], &caps[4]
            );
        }
    }

    mirror.to_string()
}

/// Rewrite a VCS clone URL to this mirror's smart-HTTP endpoint.
///
/// Git URLs (`git://`, `http(s)://`, `git@host:path`) become
/// `<mirror>/git/<host>/<path>.git`. SVN URLs are passed through unchanged;
/// anything else is stripped down to the mirror base.
pub fn rewrite_repository_url(mirror: &str, url: &str) -> String {
    if url.starts_with(mirror) {
        return url.to_string();
    }

    if SVN_REPOSITORY.is_match(url) {
        return url.to_string();
    }

    if let Some(caps) = GIT_REPOSITORY.captures(url) {
        return format!("{mirror}/git/{}/{}.git", &caps["host"], &caps["path"]);
    }

    mirror.to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MIRROR: &str = "http://mirror.example.com";

    #[test]
    fn github_zipball() {
        assert_eq!(
            rewrite_archive_url(
                MIRROR,
                "https://api.github.com/repos/acme/lib/zipball/deadbeef"
            ),
            "http://mirror.example.com/git/github.com/acme/lib/deadbeef.zip"
        );
    }

    #[test]
    fn bitbucket_get() {
        assert_eq!(
            rewrite_archive_url(MIRROR, "https://bitbucket.org/acme/lib/get/deadbeef.zip"),
            "http://mirror.example.com/git/bitbucket.org/acme/lib/deadbeef.zip"
        );
    }

    #[test]
    fn gitlab_archive() {
        assert_eq!(
            rewrite_archive_url(
                MIRROR,
                "https://gitlab.com/acme/lib/repository/archive.zip?ref=deadbeef"
            ),
            "http://mirror.example.com/git/gitlab.com/acme/lib/deadbeef.zip"
        );
    }

    #[test]
    fn unknown_archive_host_is_stripped() {
        assert_eq!(
            rewrite_archive_url(MIRROR, "https://downloads.example.net/lib-1.0.zip"),
            MIRROR
        );
    }

    #[test]
    fn archive_rewrite_is_idempotent() {
        let once = rewrite_archive_url(
            MIRROR,
            "https://api.github.com/repos/acme/lib/zipball/deadbeef",
        );
        assert_eq!(rewrite_archive_url(MIRROR, &once), once);
    }

    #[test]
    fn ssh_clone_url() {
        assert_eq!(
            rewrite_repository_url(MIRROR, "git@github.com:acme/lib.git"),
            "http://mirror.example.com/git/github.com/acme/lib.git"
        );
    }

    #[test]
    fn https_clone_url() {
        assert_eq!(
            rewrite_repository_url(MIRROR, "https://github.com/acme/lib.git"),
            "http://mirror.example.com/git/github.com/acme/lib.git"
        );
    }

    #[test]
    fn git_protocol_clone_url_without_suffix() {
        assert_eq!(
            rewrite_repository_url(MIRROR, "git://gitlab.com/acme/nested/lib"),
            "http://mirror.example.com/git/gitlab.com/acme/nested/lib.git"
        );
    }

    #[test]
    fn svn_urls_pass_through() {
        assert_eq!(
            rewrite_repository_url(MIRROR, "svn://svn.example.org/acme/trunk"),
            "svn://svn.example.org/acme/trunk"
        );
        assert_eq!(
            rewrite_repository_url(MIRROR, "http://acme.svn.sourceforge.net/svnroot/acme"),
            "http://acme.svn.sourceforge.net/svnroot/acme"
        );
    }

    #[test]
    fn unknown_repository_is_stripped() {
        assert_eq!(rewrite_repository_url(MIRROR, "hg::http://hg.example.com/x"), MIRROR);
    }

    #[test]
    fn repository_rewrite_is_idempotent() {
        let once = rewrite_repository_url(MIRROR, "git@github.com:acme/lib.git");
        assert_eq!(rewrite_repository_url(MIRROR, &once), once);
    }
}
