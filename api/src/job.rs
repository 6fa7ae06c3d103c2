use num_enum::FromPrimitive;
use std::str::FromStr;
use thiserror::Error;

use crate::Delimiters;

/// Job lease, as handed out to a worker
///
/// `lease_time` is the fencing token: renewing or finishing a job
/// requires presenting it back unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    /// Milliseconds since the unix epoch at which the lease was granted
    pub lease_time: i64,
    /// Seconds the worker has before the lease is reclaimed
    pub timeout: i64,
    /// Stored (aged) priority; smaller is served first
    pub priority: i64,
    pub url: String,
    pub retries: u32,
}

impl Job {
    /// Whether the lease ran out at `now` (unix millis)
    pub fn is_expired(&self, now: i64) -> bool {
        self.lease_time.saturating_add(self.timeout.saturating_mul(1000)) < now
    }
}

/// Why a job did not complete
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FailureReason {
    Success = 0,
    /// Lease ran out before the worker reported back
    Timeout = 1,
    /// The project at the url was already processed
    ProjectKnown = 10,
    /// The project could not be parsed
    Unparsable = 11,
    #[num_enum(catch_all)]
    Other(i32),
}

impl FailureReason {
    pub fn id(self) -> i32 {
        match self {
            FailureReason::Success => 0,
            FailureReason::Timeout => 1,
            FailureReason::ProjectKnown => 10,
            FailureReason::Unparsable => 11,
            FailureReason::Other(id) => id,
        }
    }

    pub fn is_success(self) -> bool {
        self == FailureReason::Success
    }

    /// Retrying a job that failed for these reasons can't help
    pub fn is_retriable(self) -> bool {
        !matches!(
            self,
            FailureReason::Success | FailureReason::ProjectKnown | FailureReason::Unparsable
        )
    }
}

/// Audit record of a failed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedJob {
    pub job: Job,
    pub reason: FailureReason,
    pub reason_data: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Incorrect amount of arguments.")]
    ArgumentCount,
    #[error("Incorrect job time.")]
    JobTime,
    #[error("Incorrect reason id.")]
    ReasonId,
    #[error("A job has an invalid priority, no jobs have been added to the queue.")]
    Priority,
    #[error("A job has an invalid timeout, no jobs have been added to the queue.")]
    Timeout,
    #[error("Error: invalid crawlID.")]
    CrawlId,
    #[error("Error: invalid crawl token.")]
    CrawlToken,
    #[error("Invalid language statistics.")]
    Languages,
    #[error("Invalid job assignment: {0}")]
    Assignment(String),
}

pub type PayloadResult<T> = std::result::Result<T, PayloadError>;

/// One job of an upload batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub url: String,
    /// Requested priority; larger is served sooner
    pub priority: i64,
    /// Seconds; `None` means the node default
    pub timeout: Option<i64>,
}

impl NewJob {
    pub fn new(url: impl Into<String>, priority: i64, timeout: i64) -> Self {
        Self {
            url: url.into(),
            priority,
            timeout: Some(timeout),
        }
    }

    /// `url F priority [F timeout]`
    pub fn encode(&self, d: &Delimiters) -> String {
        match self.timeout {
            Some(timeout) => d.join_fields([
                self.url.as_str(),
                self.priority.to_string().as_str(),
                timeout.to_string().as_str(),
            ]),
            None => d.join_fields([self.url.as_str(), self.priority.to_string().as_str()]),
        }
    }

    pub fn parse(line: &str, d: &Delimiters) -> PayloadResult<Self> {
        let fields: Vec<_> = d.fields(line).collect();
        let (url, priority, timeout) = match fields.as_slice() {
            [url, priority] => (url, priority, None),
            [url, priority, timeout] => (url, priority, Some(timeout)),
            _ => return Err(PayloadError::ArgumentCount),
        };
        if url.is_empty() {
            return Err(PayloadError::ArgumentCount);
        }
        let priority = i64::from_str(priority.trim()).map_err(|_| PayloadError::Priority)?;
        let timeout = timeout
            .map(|t| i64::from_str(t.trim()).map_err(|_| PayloadError::Timeout))
            .transpose()?;

        Ok(Self {
            url: (*url).to_owned(),
            priority,
            timeout,
        })
    }

    /// Parse a whole batch; any bad line rejects all of it
    pub fn parse_batch<'a>(
        lines: impl IntoIterator<Item = &'a str>,
        d: &Delimiters,
    ) -> PayloadResult<Vec<Self>> {
        lines.into_iter().map(|l| Self::parse(l, d)).collect()
    }

    pub fn encode_batch(jobs: &[NewJob], d: &Delimiters) -> String {
        let mut out = String::new();
        for job in jobs {
            out.push_str(&job.encode(d));
            out.push(d.entry_char());
        }
        out
    }
}

/// A reference to a held lease: `job_id F lease_time`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRef {
    pub job_id: String,
    pub lease_time: i64,
}

impl LeaseRef {
    pub fn encode(&self, d: &Delimiters) -> String {
        d.join_fields([self.job_id.as_str(), self.lease_time.to_string().as_str()])
    }

    pub fn parse(body: &str, d: &Delimiters) -> PayloadResult<Self> {
        let fields: Vec<_> = d.fields(trim_entry(body, d)).collect();
        let [job_id, lease_time] = fields.as_slice() else {
            return Err(PayloadError::ArgumentCount);
        };
        Self::from_fields(job_id, lease_time)
    }

    fn from_fields(job_id: &str, lease_time: &str) -> PayloadResult<Self> {
        Ok(Self {
            job_id: job_id.to_owned(),
            lease_time: i64::from_str(lease_time.trim()).map_err(|_| PayloadError::JobTime)?,
        })
    }
}

/// Body of a finish-job request: `job_id F lease_time F reason F reason_data`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub lease: LeaseRef,
    pub reason: FailureReason,
    pub reason_data: String,
}

impl JobReport {
    pub fn encode(&self, d: &Delimiters) -> String {
        d.join_fields([
            self.lease.encode(d).as_str(),
            self.reason.id().to_string().as_str(),
            self.reason_data.as_str(),
        ])
    }

    pub fn parse(body: &str, d: &Delimiters) -> PayloadResult<Self> {
        let body = trim_entry(body, d);
        // reason data is free text and may contain field delimiters
        let fields: Vec<_> = body.splitn(4, d.field_char()).collect();
        let [job_id, lease_time, reason, reason_data] = fields.as_slice() else {
            return Err(PayloadError::ArgumentCount);
        };
        let lease = LeaseRef::from_fields(job_id, lease_time)?;
        let reason = i32::from_str(reason.trim()).map_err(|_| PayloadError::ReasonId)?;

        Ok(Self {
            lease,
            reason: FailureReason::from(reason),
            reason_data: (*reason_data).to_owned(),
        })
    }
}

/// Identifies an outstanding crawl directive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlToken {
    pub crawl_id: i32,
    /// Issue time, unix millis
    pub token: i64,
}

/// Results of a crawl, uploaded by the worker that was told to crawl
///
/// ```text
/// crawl_id F token E
/// language F bytes (F language F bytes)* E
/// url F priority F timeout E
/// ...
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlData {
    pub token: CrawlToken,
    pub languages: Vec<(String, u64)>,
    pub jobs: Vec<NewJob>,
}

impl CrawlData {
    pub fn encode(&self, d: &Delimiters) -> String {
        let mut out = d.join_fields([
            self.token.crawl_id.to_string(),
            self.token.token.to_string(),
        ]);
        out.push(d.entry_char());
        out.push_str(&d.join_fields(
            self.languages
                .iter()
                .flat_map(|(lang, bytes)| [lang.clone(), bytes.to_string()]),
        ));
        out.push(d.entry_char());
        out.push_str(&NewJob::encode_batch(&self.jobs, d));
        out
    }

    pub fn parse(body: &str, d: &Delimiters) -> PayloadResult<Self> {
        // the languages line may be empty, so plain split instead of `entries`
        let mut lines = body.split(d.entry_char());

        let first = lines.next().ok_or(PayloadError::ArgumentCount)?;
        let mut fields = d.fields(first);
        let (Some(crawl_id), Some(token), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(PayloadError::ArgumentCount);
        };
        let token = CrawlToken {
            crawl_id: i32::from_str(crawl_id.trim()).map_err(|_| PayloadError::CrawlId)?,
            token: i64::from_str(token.trim()).map_err(|_| PayloadError::CrawlToken)?,
        };

        let languages = match lines.next() {
            Some(line) if !line.is_empty() => parse_languages(line, d)?,
            _ => vec![],
        };

        let jobs = NewJob::parse_batch(lines.filter(|l| !l.is_empty()), d)?;

        Ok(Self {
            token,
            languages,
            jobs,
        })
    }
}

fn parse_languages(line: &str, d: &Delimiters) -> PayloadResult<Vec<(String, u64)>> {
    let fields: Vec<_> = d.fields(line).collect();
    if fields.len() % 2 != 0 {
        return Err(PayloadError::Languages);
    }
    fields
        .chunks(2)
        .map(|pair| {
            let bytes = u64::from_str(pair[1].trim()).map_err(|_| PayloadError::Languages)?;
            Ok((pair[0].to_owned(), bytes))
        })
        .collect()
}

fn trim_entry<'a>(body: &'a str, d: &Delimiters) -> &'a str {
    body.strip_suffix(d.entry_char()).unwrap_or(body)
}

/// Answer to a get-job request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAssignment {
    /// Go process this job
    Spider {
        job_id: String,
        url: String,
        lease_time: i64,
        timeout: i64,
    },
    /// Queue is low; go crawl for more jobs and upload them with this token
    Crawl(CrawlToken),
    /// Nothing to do; a crawl is already outstanding
    NoJob(CrawlToken),
}

impl JobAssignment {
    const SPIDER: &'static str = "Spider";
    const CRAWL: &'static str = "Crawl";
    const NO_JOB: &'static str = "NoJob";

    pub fn encode(&self, d: &Delimiters) -> String {
        match self {
            JobAssignment::Spider {
                job_id,
                url,
                lease_time,
                timeout,
            } => d.join_fields([
                Self::SPIDER,
                job_id.as_str(),
                url.as_str(),
                lease_time.to_string().as_str(),
                timeout.to_string().as_str(),
            ]),
            JobAssignment::Crawl(token) => Self::encode_token(Self::CRAWL, token, d),
            JobAssignment::NoJob(token) => Self::encode_token(Self::NO_JOB, token, d),
        }
    }

    fn encode_token(kind: &str, token: &CrawlToken, d: &Delimiters) -> String {
        d.join_fields([
            kind,
            token.crawl_id.to_string().as_str(),
            token.token.to_string().as_str(),
        ])
    }

    pub fn parse(message: &str, d: &Delimiters) -> PayloadResult<Self> {
        let fields: Vec<_> = d.fields(message).collect();
        let invalid = || PayloadError::Assignment(message.to_owned());

        match fields.as_slice() {
            [Self::SPIDER, job_id, url, lease_time, timeout] => Ok(JobAssignment::Spider {
                job_id: (*job_id).to_owned(),
                url: (*url).to_owned(),
                lease_time: i64::from_str(lease_time).map_err(|_| invalid())?,
                timeout: i64::from_str(timeout).map_err(|_| invalid())?,
            }),
            [kind, crawl_id, token] if *kind == Self::CRAWL || *kind == Self::NO_JOB => {
                let token = CrawlToken {
                    crawl_id: i32::from_str(crawl_id).map_err(|_| invalid())?,
                    token: i64::from_str(token).map_err(|_| invalid())?,
                };
                Ok(if *kind == Self::CRAWL {
                    JobAssignment::Crawl(token)
                } else {
                    JobAssignment::NoJob(token)
                })
            }
            _ => Err(invalid()),
        }
    }
}
