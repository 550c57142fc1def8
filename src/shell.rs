//! Line-oriented search session: type a query, then page and drill down.

use crate::model::types::{ResultItems, ResultKind, Scope};
use crate::search::{SearchEngine, SearchError, SearchRequest};
use crate::session::{Page, SessionKey};
use crate::settings::{SettingUpdate, SettingsStore};
use anyhow::Result;
use std::fmt::Write as _;
use std::io::{BufRead, Write};

const HELP: &str = "\
<text>          search (criteria like author:..., title=..., year>=... also work)
:page N         show page N
:next / :prev   move one page
:series ID      books of a series from the current search
:author ID      books of an author from the current search
:view KIND      books | series | authors, re-running the current query
:book ID        details of one book
:info ID        details of one author
:set KEY VALUE  change a setting (page_size, lang, size, rating, view, area, format)
:settings       show settings
:help           this text
:quit           leave";

const BLOCKED: &str = "access denied";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Search(String),
    Page(usize),
    Next,
    Prev,
    Drill(Scope),
    View(ResultKind),
    Book(i64),
    AuthorInfo(i64),
    Set(String, String),
    Settings,
    Help,
    Quit,
}

impl ShellCommand {
    /// `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix(':') else {
            return Ok(Some(ShellCommand::Search(line.to_string())));
        };

        let mut parts = rest.split_whitespace();
        let name = parts.next().unwrap_or_default().to_ascii_lowercase();
        let arg = parts.next();
        let number = |arg: Option<&str>| -> Result<i64, String> {
            arg.ok_or_else(|| format!(":{name} needs a number"))?
                .parse()
                .map_err(|_| format!(":{name} needs a number"))
        };

        let cmd = match name.as_str() {
            "page" | "p" => {
                let n = number(arg)?;
                if n < 1 {
                    return Err("pages start at 1".into());
                }
                ShellCommand::Page(usize::try_from(n - 1).map_err(|e| e.to_string())?)
            }
            "next" | "n" => ShellCommand::Next,
            "prev" => ShellCommand::Prev,
            "series" => ShellCommand::Drill(Scope::Series(number(arg)?)),
            "author" => ShellCommand::Drill(Scope::Author(number(arg)?)),
            "view" => ShellCommand::View(arg.ok_or(":view needs a kind")?.parse()?),
            "book" | "b" => ShellCommand::Book(number(arg)?),
            "info" => ShellCommand::AuthorInfo(number(arg)?),
            "set" => {
                let key = arg.ok_or(":set needs a key and a value")?;
                let value = parts.collect::<Vec<_>>().join(" ");
                ShellCommand::Set(key.to_string(), value)
            }
            "settings" => ShellCommand::Settings,
            "help" | "h" | "?" => ShellCommand::Help,
            "quit" | "q" | "exit" => ShellCommand::Quit,
            other => return Err(format!("unknown command :{other}, try :help")),
        };
        Ok(Some(cmd))
    }
}

pub struct Shell<'a> {
    engine: &'a SearchEngine,
    settings: &'a SettingsStore,
    user_id: i64,
    key: SessionKey,
    /// Kind and index of the page last shown.
    position: Option<(ResultKind, usize)>,
}

impl<'a> Shell<'a> {
    pub fn new(
        engine: &'a SearchEngine,
        settings: &'a SettingsStore,
        user_id: i64,
        chat_id: i64,
    ) -> Self {
        Self {
            engine,
            settings,
            user_id,
            key: SessionKey::resolve(user_id, chat_id),
            position: None,
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Read commands until `:quit` or end of input.
    pub fn run(&mut self, input: impl BufRead, mut out: impl Write) -> Result<()> {
        writeln!(out, "session {}; :help for commands", self.key)?;
        for line in input.lines() {
            let line = line?;
            let reply = match ShellCommand::parse(&line) {
                Ok(None) => continue,
                Ok(Some(ShellCommand::Quit)) => break,
                Ok(Some(cmd)) => self.handle(cmd)?,
                Err(msg) => msg,
            };
            writeln!(out, "{reply}")?;
        }
        Ok(())
    }

    /// Execute one command and return the text to show.
    pub fn handle(&mut self, cmd: ShellCommand) -> Result<String> {
        let settings = self.settings.get_or_create(self.user_id)?;
        if settings.blocked && !matches!(cmd, ShellCommand::Help | ShellCommand::Quit) {
            tracing::info!(user_id = self.user_id, "refused command from blocked user");
            return Ok(BLOCKED.to_string());
        }
        let outcome = match cmd {
            ShellCommand::Search(text) => {
                let request = SearchRequest::new(text, settings.facets(), settings.view);
                self.engine
                    .search_into_session(self.key, &request, settings.page_size)
            }
            ShellCommand::Page(index) => self.page(index),
            ShellCommand::Next => match self.position {
                Some((_, index)) => self.page(index + 1),
                None => Err(SearchError::SessionExpired),
            },
            ShellCommand::Prev => match self.position {
                Some((_, 0)) => return Ok("already on the first page".into()),
                Some((_, index)) => self.page(index - 1),
                None => Err(SearchError::SessionExpired),
            },
            ShellCommand::Drill(scope) => {
                self.engine.drill_down(self.key, scope, settings.page_size)
            }
            ShellCommand::View(kind) => {
                let updated = self.settings.apply(self.user_id, SettingUpdate::View(kind))?;
                if self.engine.sessions().state(&self.key).is_none() {
                    return Ok(format!("view set to {kind}"));
                }
                self.engine.switch_view(self.key, kind, updated.page_size)
            }
            ShellCommand::Book(file_id) => {
                return Ok(match self.engine.book_details(file_id) {
                    Ok(Some(card)) => card.to_string().trim_end().to_string(),
                    Ok(None) => format!("no book {file_id}"),
                    Err(err @ SearchError::Backend(_)) => {
                        format!("lookup failed, try again later ({err})")
                    }
                    Err(err) => return Err(err.into()),
                });
            }
            ShellCommand::AuthorInfo(author_id) => {
                return Ok(match self.engine.author_details(author_id) {
                    Ok(Some(card)) => card.to_string().trim_end().to_string(),
                    Ok(None) => format!("no author {author_id}"),
                    Err(err @ SearchError::Backend(_)) => {
                        format!("lookup failed, try again later ({err})")
                    }
                    Err(err) => return Err(err.into()),
                });
            }
            ShellCommand::Set(key, value) => {
                let update = match SettingUpdate::parse(&key, &value) {
                    Ok(update) => update,
                    Err(err) => return Ok(err.to_string()),
                };
                return Ok(self.settings.apply(self.user_id, update)?.to_string());
            }
            ShellCommand::Settings => return Ok(settings.to_string()),
            ShellCommand::Help => return Ok(HELP.to_string()),
            ShellCommand::Quit => return Ok(String::new()),
        };

        match outcome {
            Ok(page) => {
                self.position = Some((page.items.kind(), page.page_index));
                Ok(render_page(&page))
            }
            Err(SearchError::SessionExpired) => {
                self.position = None;
                Ok("search session expired, run a new search".into())
            }
            Err(err @ (SearchError::PageOutOfRange { .. } | SearchError::Superseded)) => {
                Ok(err.to_string())
            }
            Err(err @ SearchError::Backend(_)) => {
                Ok(format!("search failed, try again later ({err})"))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn page(&self, index: usize) -> Result<Page, SearchError> {
        match self.position {
            Some((kind, _)) => self.engine.get_page(&self.key, kind, index),
            None => self.engine.sessions().current_page(&self.key, index),
        }
    }
}

/// Plain-text rendering of one page.
pub fn render_page(page: &Page) -> String {
    if page.total_count == 0 {
        return "nothing found".to_string();
    }

    let mut out = String::new();
    match &page.items {
        ResultItems::Books(books) => {
            for book in books {
                let _ = write!(out, "[{}] {}", book.file_id, book.title);
                let author = book.author_name();
                if !author.is_empty() {
                    let _ = write!(out, " / {author}");
                }
                if let Some(series) = &book.series_title {
                    let _ = write!(out, " ({series})");
                }
                if let Some(year) = book.year {
                    let _ = write!(out, " {year}");
                }
                if let Some(lang) = &book.language {
                    let _ = write!(out, " {lang}");
                }
                let _ = write!(out, " {}KB", book.size_bytes / 1024);
                if book.rating > 0 {
                    let _ = write!(out, " rating {}", book.rating);
                }
                out.push('\n');
            }
        }
        ResultItems::Series(series) => {
            for s in series {
                let _ = writeln!(
                    out,
                    "{} ({} books)  :series {}",
                    s.series_title, s.book_count, s.series_id
                );
            }
        }
        ResultItems::Authors(authors) => {
            for a in authors {
                let _ = writeln!(
                    out,
                    "{} ({} books)  :author {}",
                    a.author_name, a.book_count, a.author_id
                );
            }
        }
    }
    let _ = write!(
        out,
        "page {}/{}, {} {} found",
        page.page_index + 1,
        page.page_count,
        page.total_count,
        page.items.kind()
    );
    out
}
