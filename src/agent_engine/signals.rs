//! Pure string/regex detectors used by the session loop, its guards and the
//! scheduler. None of these hold state.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::browser::InteractiveElement;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    En,
    Ru,
}

static CYRILLIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{Cyrillic}]").expect("cyrillic regex"));

pub fn has_cyrillic(text: &str) -> bool {
    CYRILLIC_RE.is_match(text)
}

/// Language used for user-facing messages: Russian when the goal is written in Cyrillic.
pub fn detect_language(text: &str) -> Language {
    if has_cyrillic(text) {
        Language::Ru
    } else {
        Language::En
    }
}

// ── Access issues ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessIssue {
    Captcha,
    IpBlocked,
    TwoFactor,
    AccessDenied,
    LoginRequired,
}

static CAPTCHA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)captcha|verify (?:that )?you(?: are|'re) (?:a )?human|are you a robot|i'?m not a robot|unusual traffic|checking your browser|bot check|не робот|капч",
    )
    .expect("captcha regex")
});

static IP_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bip(?: address)? (?:has been |is |was )?(?:blocked|banned|blacklisted)|access from your (?:ip|region|country) is (?:blocked|restricted)|ваш ip(?: адрес)? (?:был )?заблокирован",
    )
    .expect("ip block regex")
});

static TWO_FACTOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)two[- ]factor|\b2fa\b|verification code|one[- ]time (?:code|password)|authenticator app|enter the code we sent|код подтверждения|двухфакторн",
    )
    .expect("two factor regex")
});

static ACCESS_DENIED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)access denied|403 forbidden|you (?:do not|don't) have permission|доступ запрещ|нет доступа",
    )
    .expect("access denied regex")
});

static LOGIN_REQUIRED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:log ?in|sign ?in) to (?:continue|view|access)|login required|you must (?:be )?(?:logged|signed) in|войдите,? чтобы|требуется (?:вход|авторизация)|необходимо (?:войти|авторизоваться)",
    )
    .expect("login required regex")
});

/// Scans the title first, then the visible text. Most specific issue wins.
pub fn detect_access_issue(title: &str, text: &str) -> Option<AccessIssue> {
    let checks: [(&Lazy<Regex>, AccessIssue); 5] = [
        (&CAPTCHA_RE, AccessIssue::Captcha),
        (&IP_BLOCK_RE, AccessIssue::IpBlocked),
        (&TWO_FACTOR_RE, AccessIssue::TwoFactor),
        (&ACCESS_DENIED_RE, AccessIssue::AccessDenied),
        (&LOGIN_REQUIRED_RE, AccessIssue::LoginRequired),
    ];
    for haystack in [title, text] {
        if haystack.is_empty() {
            continue;
        }
        for (re, issue) in checks.iter() {
            if re.is_match(haystack) {
                return Some(*issue);
            }
        }
    }
    None
}

impl AccessIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessIssue::Captcha => "captcha",
            AccessIssue::IpBlocked => "ip_blocked",
            AccessIssue::TwoFactor => "two_factor",
            AccessIssue::AccessDenied => "access_denied",
            AccessIssue::LoginRequired => "login_required",
        }
    }

    pub fn message(&self, lang: Language) -> &'static str {
        match (self, lang) {
            (AccessIssue::Captcha, Language::En) => {
                "The site is showing a CAPTCHA or bot check. Please solve it in the browser window, then reply to continue."
            }
            (AccessIssue::Captcha, Language::Ru) => {
                "Сайт показывает капчу или проверку на робота. Пройдите её в окне браузера и ответьте, чтобы продолжить."
            }
            (AccessIssue::IpBlocked, Language::En) => {
                "The site reports that this IP address is blocked. Change network or VPN, or tell me how to proceed."
            }
            (AccessIssue::IpBlocked, Language::Ru) => {
                "Сайт сообщает, что этот IP-адрес заблокирован. Смените сеть или VPN либо подскажите, как продолжить."
            }
            (AccessIssue::TwoFactor, Language::En) => {
                "The site asks for a two-factor verification code. Enter it in the browser window, then reply to continue."
            }
            (AccessIssue::TwoFactor, Language::Ru) => {
                "Сайт запрашивает код двухфакторной проверки. Введите его в окне браузера и ответьте, чтобы продолжить."
            }
            (AccessIssue::AccessDenied, Language::En) => {
                "Access to this page is denied. Tell me whether to try another page or stop."
            }
            (AccessIssue::AccessDenied, Language::Ru) => {
                "Доступ к этой странице запрещён. Подскажите, попробовать другую страницу или остановиться."
            }
            (AccessIssue::LoginRequired, Language::En) => {
                "The site requires you to log in. Please sign in in the browser window, then reply to continue."
            }
            (AccessIssue::LoginRequired, Language::Ru) => {
                "Сайт требует входа. Войдите в аккаунт в окне браузера и ответьте, чтобы продолжить."
            }
        }
    }
}

// ── Goal URLs ────────────────────────────────────────────────────────────────

static GOAL_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)https?://[^\s<>]+|\bwww\.[^\s<>]+|\b(?:[a-z0-9-]+\.)+[a-z]{2,10}\b(?:/[^\s<>]*)?")
        .expect("goal url regex")
});

static ORDERING_CUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:then|after|afterwards|next|first|followed by|finally)\b|затем|потом|после|сначала|далее",
    )
    .expect("ordering cue regex")
});

/// File extensions that look like TLDs but never are in a goal.
const NOT_TLDS: &[&str] = &[
    "txt", "pdf", "png", "jpg", "jpeg", "gif", "exe", "json", "csv", "md", "rs", "py", "js", "html", "zip",
];

fn trim_url_tail(raw: &str) -> &str {
    raw.trim_end_matches(|c: char| matches!(c, ')' | '.' | ',' | ';' | ':' | '!' | '?' | '"' | '\'' | '»'))
}

fn with_scheme(raw: &str) -> String {
    if raw.to_ascii_lowercase().starts_with("http://") || raw.to_ascii_lowercase().starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    }
}

/// Goal URLs with the byte span each first appeared at.
fn goal_url_spans(goal: &str) -> Vec<(String, Range<usize>)> {
    let mut found: Vec<(String, Range<usize>)> = Vec::new();
    for m in GOAL_URL_RE.find_iter(goal) {
        let raw = trim_url_tail(m.as_str());
        if raw.is_empty() {
            continue;
        }
        let host_part = raw.split('/').next().unwrap_or(raw);
        let tld = host_part.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
        if !raw.contains("://") && NOT_TLDS.contains(&tld.as_str()) {
            continue;
        }
        let url = with_scheme(raw);
        if !found.iter().any(|(seen, _)| *seen == url) {
            found.push((url, m.start()..m.start() + raw.len()));
        }
    }
    found
}

/// URLs named in the goal, normalised to absolute form, in order of appearance.
pub fn extract_goal_urls(goal: &str) -> Vec<String> {
    goal_url_spans(goal).into_iter().map(|(url, _)| url).collect()
}

/// "after" / "после" followed by the object it refers back to ("after
/// that", "после этого") keeps the written order.
static REVERSE_CUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bafter\b(\s+(?:that|this|which|it)\b)?|после(\s+(?:этого|чего)\b)?")
        .expect("reverse cue regex")
});

fn reverses_order(between: &str) -> bool {
    REVERSE_CUE_RE
        .captures_iter(between)
        .any(|c| c.get(1).is_none() && c.get(2).is_none())
}

/// Goal URLs in the order they should be visited. "open B after A" yields
/// A then B; chains such as "C after B after A" are reversed as a run.
pub fn ordered_goal_urls(goal: &str) -> Vec<String> {
    let spans = goal_url_spans(goal);
    let mut out = Vec::with_capacity(spans.len());
    let mut run: Vec<String> = Vec::new();
    for (i, (url, span)) in spans.iter().enumerate() {
        run.push(url.clone());
        let linked = spans
            .get(i + 1)
            .is_some_and(|(_, next)| span.end <= next.start && reverses_order(&goal[span.end..next.start]));
        if !linked {
            out.extend(run.drain(..).rev());
        }
    }
    out
}

pub fn has_ordering_cue(goal: &str) -> bool {
    ORDERING_CUE_RE.is_match(goal)
}

/// Host (without `www.`) plus path (without trailing slash), lowercased.
pub fn normalize_url(raw: &str) -> Option<String> {
    let parsed = Url::parse(&with_scheme(raw.trim())).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    let path = parsed.path().trim_end_matches('/');
    let mut out = format!("{host}{}", path.to_lowercase());
    if let Some(q) = parsed.query() {
        out.push('?');
        out.push_str(q);
    }
    Some(out)
}

/// True when `current` is the goal page or lies underneath it.
pub fn url_matches_prefix(current: &str, goal: &str) -> bool {
    let (Some(current), Some(goal)) = (normalize_url(current), normalize_url(goal)) else {
        return false;
    };
    if !current.starts_with(&goal) {
        return false;
    }
    matches!(current[goal.len()..].chars().next(), None | Some('/') | Some('?') | Some('#'))
}

// ── Start URL ────────────────────────────────────────────────────────────────

pub fn search_engine_url(name: &str) -> &'static str {
    match name.trim().to_lowercase().as_str() {
        "duckduckgo" => "https://duckduckgo.com",
        "bing" => "https://www.bing.com",
        "yandex" => "https://yandex.ru",
        _ => "https://www.google.com",
    }
}

fn mentions_wikipedia(goal: &str) -> bool {
    let lower = goal.to_lowercase();
    lower.contains("wikipedia") || lower.contains("википед")
}

/// A concrete URL derived from the goal: a Wikipedia search when the goal asks
/// for Wikipedia, otherwise the first URL, `www.` host or bare domain named.
pub fn start_url(goal: &str) -> Option<String> {
    if mentions_wikipedia(goal) {
        let query = goal_query(goal);
        if query.is_empty() {
            return Some("https://www.wikipedia.org".into());
        }
        let base = if goal.to_lowercase().contains("ru.wikipedia.org") || has_cyrillic(goal) {
            "https://ru.wikipedia.org/w/index.php"
        } else {
            "https://en.wikipedia.org/w/index.php"
        };
        return Url::parse_with_params(base, &[("search", query.as_str())])
            .ok()
            .map(String::from);
    }
    extract_goal_urls(goal).into_iter().next()
}

/// Where the first turn navigates before any decision is made.
pub fn bootstrap_url(goal: &str, search_engine: &str) -> String {
    start_url(goal).unwrap_or_else(|| search_engine_url(search_engine).to_string())
}

static QUOTED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]{2,})"|«([^»]{2,})»|“([^”]{2,})”"#).expect("quoted regex"));

const QUERY_FILLER: &[&str] = &[
    "please", "open", "go", "to", "navigate", "search", "find", "look", "up", "for", "on", "in", "at", "the",
    "a", "an", "about", "and", "me", "show", "wikipedia", "article", "page", "google", "then", "information",
    "пожалуйста", "открой", "перейди", "зайди", "найди", "поищи", "поиск", "покажи", "в", "на", "про", "о",
    "об", "и", "статью", "статья", "страницу", "википедии", "википедия", "информацию", "затем",
];

/// Search terms from the goal: quoted text when present, otherwise the goal
/// minus URLs and filler words.
pub fn goal_query(goal: &str) -> String {
    if let Some(caps) = QUOTED_RE.captures(goal) {
        if let Some(m) = caps.iter().skip(1).flatten().next() {
            return m.as_str().trim().to_string();
        }
    }
    let without_urls = GOAL_URL_RE.replace_all(goal, " ");
    let words: Vec<&str> = without_urls
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '.' | ';' | ':' | '!' | '?'))
        .filter(|w| !w.is_empty())
        .filter(|w| !QUERY_FILLER.contains(&w.to_lowercase().as_str()))
        .collect();
    let query = words.join(" ");
    query.chars().take(100).collect::<String>().trim().to_string()
}

// ── Pages and elements ───────────────────────────────────────────────────────

static INFORMATIONAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\babout(?: us)?\b|\bprivacy\b|\bterms\b|\bcookies?\b|\blegal\b|\bimprint\b|о нас|о компании|конфиденциальн|пользовательское соглашение|условия использования",
    )
    .expect("informational regex")
});

const INFORMATIONAL_PATHS: &[&str] = &["about", "privacy", "terms", "cookies", "cookie-policy", "legal", "imprint"];

pub fn is_informational_label(label: &str) -> bool {
    INFORMATIONAL_RE.is_match(label)
}

pub fn is_informational_url(raw: &str) -> bool {
    let Ok(parsed) = Url::parse(&with_scheme(raw.trim())) else {
        return false;
    };
    parsed
        .path_segments()
        .map(|mut segs| {
            segs.any(|s| {
                let s = s.to_ascii_lowercase();
                INFORMATIONAL_PATHS.iter().any(|p| s == *p || s.starts_with(&format!("{p}-")) || s.starts_with(&format!("{p}.")))
            })
        })
        .unwrap_or(false)
}

/// Whether the goal itself asks for an about/privacy/terms page.
pub fn goal_wants_informational(goal: &str) -> bool {
    is_informational_label(goal)
}

/// A search engine home page with no query submitted yet.
pub fn is_search_landing(raw: &str) -> bool {
    let Ok(parsed) = Url::parse(raw.trim()) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let engine = host.starts_with("google.")
        || host == "bing.com"
        || host == "duckduckgo.com"
        || host.starts_with("yandex.");
    if !engine {
        return false;
    }
    let path = parsed.path().trim_end_matches('/');
    let landing_path = path.is_empty() || path == "/webhp";
    let has_query = parsed
        .query_pairs()
        .any(|(k, v)| matches!(k.as_ref(), "q" | "text") && !v.trim().is_empty());
    landing_path && !has_query
}

const SEARCH_MARKERS: &[&str] = &["search", "find", "query", "поиск", "найти"];
const NON_SEARCH_MARKERS: &[&str] = &[
    "email", "e-mail", "password", "phone", "login", "username", "2fa", "otp", "пароль", "почта", "телефон",
    "логин", "код",
];

pub fn looks_like_search_field(element: &InteractiveElement) -> bool {
    let role = element.role.to_lowercase();
    if role.contains("search") {
        return true;
    }
    let haystack = format!("{} {} {}", element.name, element.aria_label, element.text).to_lowercase();
    if NON_SEARCH_MARKERS.iter().any(|m| haystack.contains(m)) {
        return false;
    }
    SEARCH_MARKERS.iter().any(|m| haystack.contains(m))
}

// ── Task-level intent ────────────────────────────────────────────────────────

const DIRECT_MARKERS: &[&str] = &[
    "failed to start",
    "event stream error",
    "traceback",
    "stack trace",
    "exception",
    "error:",
    "no browser",
    "without browser",
    "do not open",
    "don't open",
    "ошибк",
    "исключен",
    "трейсбек",
    "стектрейс",
    "не открывай",
    "без браузер",
    "без окн",
];

const BROWSER_ACTIONS: &[&str] = &[
    "open", "go to", "navigate", "search", "find", "click", "login", "log in", "sign in", "register", "checkout",
    "buy", "order", "pay", "submit", "fill", "apply", "respond", "delete", "remove", "download", "upload", "book",
    "reserve", "открой", "перейди", "зайди", "найди", "поиск", "нажми", "кликни", "введи", "заполни", "удали",
    "купить", "заказ", "оплат", "отправ", "отклик", "скач", "загруз",
];

/// Prompts that explicitly ask not to use the browser or paste an error to explain.
pub fn force_direct(prompt: &str) -> bool {
    let text = prompt.to_lowercase();
    DIRECT_MARKERS.iter().any(|m| text.contains(m))
}

/// Prompts that name a site or ask for a browser action.
pub fn is_browser_task(prompt: &str) -> bool {
    if !extract_goal_urls(prompt).is_empty() {
        return true;
    }
    let text = prompt.to_lowercase();
    BROWSER_ACTIONS.iter().any(|a| text.contains(a))
}

static DECLINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:no|nope|cancel|deny|reject|abort|don'?t|do not|stop|нет|отмена|отмени|не надо|не нужно|стоп)\b",
    )
    .expect("decline regex")
});

/// A user reply that refuses the pending action.
pub fn is_decline(reply: &str) -> bool {
    DECLINE_RE.is_match(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captcha_title_is_detected() {
        assert_eq!(
            detect_access_issue("Please verify you are human", ""),
            Some(AccessIssue::Captcha)
        );
        assert_eq!(
            detect_access_issue("Shop", "Our systems have detected unusual traffic"),
            Some(AccessIssue::Captcha)
        );
        assert!(AccessIssue::Captcha.message(Language::En).contains("CAPTCHA"));
    }

    #[test]
    fn other_access_issues() {
        assert_eq!(detect_access_issue("403 Forbidden", ""), Some(AccessIssue::AccessDenied));
        assert_eq!(
            detect_access_issue("Mail", "Enter the verification code from your authenticator app"),
            Some(AccessIssue::TwoFactor)
        );
        assert_eq!(
            detect_access_issue("", "Your IP address has been blocked"),
            Some(AccessIssue::IpBlocked)
        );
        assert_eq!(
            detect_access_issue("Forum", "Please log in to continue"),
            Some(AccessIssue::LoginRequired)
        );
        assert_eq!(detect_access_issue("Войдите, чтобы продолжить", ""), Some(AccessIssue::LoginRequired));
        assert_eq!(detect_access_issue("Example Domain", "This domain is for use in examples"), None);
    }

    #[test]
    fn goal_urls_and_ordering() {
        let goal = "Open https://a.example.com/start then go to b.example.org, and report";
        assert_eq!(
            extract_goal_urls(goal),
            vec!["https://a.example.com/start".to_string(), "https://b.example.org".to_string()]
        );
        assert!(has_ordering_cue(goal));
        assert!(!has_ordering_cue("open example.com and example.org"));
        assert!(extract_goal_urls("summarize notes.txt").is_empty());
    }

    #[test]
    fn after_puts_the_later_url_second() {
        assert_eq!(
            ordered_goal_urls("Open https://b.test after you open https://a.test"),
            vec!["https://a.test".to_string(), "https://b.test".to_string()]
        );
        assert_eq!(
            ordered_goal_urls("open c.test after b.test after a.test"),
            vec!["https://a.test", "https://b.test", "https://c.test"]
        );
        assert_eq!(
            ordered_goal_urls("open a.test and after that b.test"),
            vec!["https://a.test", "https://b.test"]
        );
        assert_eq!(
            ordered_goal_urls("открой b.test после того как откроешь a.test"),
            vec!["https://a.test", "https://b.test"]
        );
    }

    #[test]
    fn prefix_matching_respects_boundaries() {
        assert!(url_matches_prefix("https://www.example.com/a/b", "https://example.com/a"));
        assert!(url_matches_prefix("https://example.com/", "example.com"));
        assert!(!url_matches_prefix("https://example.com/ab", "https://example.com/a"));
        assert!(!url_matches_prefix("https://example.com.evil.org", "example.com"));
    }

    #[test]
    fn start_url_resolution() {
        assert_eq!(start_url("look at www.rust-lang.org."), Some("https://www.rust-lang.org".into()));
        assert_eq!(
            start_url("find \"Ada Lovelace\" on wikipedia"),
            Some("https://en.wikipedia.org/w/index.php?search=Ada+Lovelace".into())
        );
        assert!(start_url("найди Пушкин в википедии").unwrap().starts_with("https://ru.wikipedia.org/"));
        assert_eq!(bootstrap_url("weather tomorrow", "bing"), "https://www.bing.com");
        assert_eq!(search_engine_url("altavista"), "https://www.google.com");
    }

    #[test]
    fn query_strips_filler() {
        assert_eq!(goal_query("search for rust async book on google"), "rust async book");
        assert_eq!(goal_query("find «Война и мир»"), "Война и мир");
    }

    #[test]
    fn informational_markers() {
        assert!(is_informational_label("Privacy Policy"));
        assert!(is_informational_label("About us"));
        assert!(!is_informational_label("Products"));
        assert!(is_informational_url("https://example.com/legal/privacy"));
        assert!(!is_informational_url("https://example.com/products"));
    }

    #[test]
    fn search_landing_pages() {
        assert!(is_search_landing("https://www.google.com/"));
        assert!(is_search_landing("https://duckduckgo.com"));
        assert!(!is_search_landing("https://www.google.com/search?q=rust"));
        assert!(!is_search_landing("https://example.com/"));
    }

    #[test]
    fn search_field_detection() {
        let search = InteractiveElement {
            id: "1".into(),
            role: "textbox".into(),
            name: "Search products".into(),
            ..Default::default()
        };
        let email = InteractiveElement {
            id: "2".into(),
            role: "textbox".into(),
            name: "Find your account by email".into(),
            ..Default::default()
        };
        assert!(looks_like_search_field(&search));
        assert!(!looks_like_search_field(&email));
    }

    #[test]
    fn direct_mode_markers() {
        assert!(force_direct("Explain this Traceback please"));
        assert!(force_direct("не открывай браузер, просто ответь"));
        assert!(is_browser_task("open github.com"));
        assert!(is_browser_task("найди билеты"));
        assert!(!is_browser_task("what is the capital of France"));
    }

    #[test]
    fn decline_replies() {
        assert!(is_decline("No, leave it"));
        assert!(is_decline("cancel"));
        assert!(is_decline("нет"));
        assert!(!is_decline("yes"));
        assert!(!is_decline("notice the banner"));
    }
}
