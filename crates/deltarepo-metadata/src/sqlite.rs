//! SQLite companions of the XML metadata (yum database version 10).

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use deltarepo_utils::{
    compression::{compress_file, CompressionType},
    hash::ChecksumType,
};
use rusqlite::{params, Connection, Statement, Transaction};
use tracing::debug;

use crate::{
    error::{IoContext, MetadataResult},
    package::Package,
    repomd::RepomdRecord,
};

pub const DB_VERSION: u32 = 10;

const PRIMARY_SCHEMA: &str = "
    CREATE TABLE db_info (dbversion INTEGER, checksum TEXT);
    CREATE TABLE packages (
        pkgKey INTEGER PRIMARY KEY, pkgId TEXT, name TEXT, arch TEXT,
        version TEXT, epoch TEXT, release TEXT, summary TEXT, description TEXT,
        url TEXT, time_file INTEGER, time_build INTEGER, rpm_license TEXT,
        rpm_vendor TEXT, rpm_group TEXT, rpm_buildhost TEXT, rpm_sourcerpm TEXT,
        rpm_header_start INTEGER, rpm_header_end INTEGER, rpm_packager TEXT,
        size_package INTEGER, size_installed INTEGER, size_archive INTEGER,
        location_href TEXT, location_base TEXT, checksum_type TEXT
    );
    CREATE TABLE files (name TEXT, type TEXT, pkgKey INTEGER);
    CREATE TABLE requires (
        name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT,
        pkgKey INTEGER, pre BOOLEAN DEFAULT FALSE
    );
    CREATE TABLE provides (
        name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER
    );
    CREATE TABLE conflicts (
        name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER
    );
    CREATE TABLE obsoletes (
        name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER
    );
";

const PRIMARY_INDEXES: &str = "
    CREATE INDEX packagename ON packages (name);
    CREATE INDEX packageId ON packages (pkgId);
    CREATE INDEX filenames ON files (name);
    CREATE INDEX pkgfiles ON files (pkgKey);
    CREATE INDEX pkgprovides ON provides (pkgKey);
    CREATE INDEX providesname ON provides (name);
    CREATE INDEX pkgrequires ON requires (pkgKey);
    CREATE INDEX requiresname ON requires (name);
    CREATE INDEX pkgconflicts ON conflicts (pkgKey);
    CREATE INDEX pkgobsoletes ON obsoletes (pkgKey);
";

const FILELISTS_SCHEMA: &str = "
    CREATE TABLE db_info (dbversion INTEGER, checksum TEXT);
    CREATE TABLE packages (pkgKey INTEGER PRIMARY KEY, pkgId TEXT);
    CREATE TABLE filelist (pkgKey INTEGER, dirname TEXT, filenames TEXT, filetypes TEXT);
";

const FILELISTS_INDEXES: &str = "
    CREATE INDEX keyfile ON filelist (pkgKey);
    CREATE INDEX pkgId ON packages (pkgId);
    CREATE INDEX dirnames ON filelist (dirname);
";

const OTHER_SCHEMA: &str = "
    CREATE TABLE db_info (dbversion INTEGER, checksum TEXT);
    CREATE TABLE packages (pkgKey INTEGER PRIMARY KEY, pkgId TEXT);
    CREATE TABLE changelog (pkgKey INTEGER, author TEXT, date INTEGER, changelog TEXT);
";

const OTHER_INDEXES: &str = "
    CREATE INDEX keychange ON changelog (pkgKey);
    CREATE INDEX pkgId ON packages (pkgId);
";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DbKind {
    Primary,
    Filelists,
    Other,
}

impl DbKind {
    /// Resolves the XML metadata type a database belongs to.
    pub fn from_metadata_kind(kind: &str) -> Option<Self> {
        match kind {
            "primary" => Some(DbKind::Primary),
            "filelists" => Some(DbKind::Filelists),
            "other" => Some(DbKind::Other),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DbKind::Primary => "primary",
            DbKind::Filelists => "filelists",
            DbKind::Other => "other",
        }
    }

    /// The repomd record type, e.g. `primary_db`.
    pub fn record_kind(&self) -> String {
        format!("{}_db", self.name())
    }

    fn schema(&self) -> &'static str {
        match self {
            DbKind::Primary => PRIMARY_SCHEMA,
            DbKind::Filelists => FILELISTS_SCHEMA,
            DbKind::Other => OTHER_SCHEMA,
        }
    }

    fn indexes(&self) -> &'static str {
        match self {
            DbKind::Primary => PRIMARY_INDEXES,
            DbKind::Filelists => FILELISTS_INDEXES,
            DbKind::Other => OTHER_INDEXES,
        }
    }
}

impl fmt::Display for DbKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

struct DbStatements<'a> {
    package: Statement<'a>,
    file: Option<Statement<'a>>,
    dependencies: Vec<(Statement<'a>, bool)>,
    filelist: Option<Statement<'a>>,
    changelog: Option<Statement<'a>>,
}

impl<'a> DbStatements<'a> {
    fn new(tx: &'a Transaction, kind: DbKind) -> rusqlite::Result<Self> {
        let dependency_insert = move |table: &str| {
            tx.prepare(&format!(
                "INSERT INTO {table} (name, flags, epoch, version, release, pkgKey)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ))
        };

        Ok(match kind {
            DbKind::Primary => {
                Self {
                    package: tx.prepare(
                        "INSERT INTO packages (
                            pkgId, name, arch, version, epoch, release, summary,
                            description, url, time_file, time_build, rpm_license,
                            rpm_vendor, rpm_group, rpm_buildhost, rpm_sourcerpm,
                            rpm_header_start, rpm_header_end, rpm_packager,
                            size_package, size_installed, size_archive,
                            location_href, location_base, checksum_type
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                            ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
                    )?,
                    file: Some(
                        tx.prepare("INSERT INTO files (name, type, pkgKey) VALUES (?1, ?2, ?3)")?,
                    ),
                    dependencies: vec![
                        (dependency_insert("provides")?, false),
                        (
                            tx.prepare(
                                "INSERT INTO requires
                                 (name, flags, epoch, version, release, pkgKey, pre)
                                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                            )?,
                            true,
                        ),
                        (dependency_insert("conflicts")?, false),
                        (dependency_insert("obsoletes")?, false),
                    ],
                    filelist: None,
                    changelog: None,
                }
            }
            DbKind::Filelists => {
                Self {
                    package: tx.prepare("INSERT INTO packages (pkgId) VALUES (?1)")?,
                    file: None,
                    dependencies: Vec::new(),
                    filelist: Some(tx.prepare(
                        "INSERT INTO filelist (pkgKey, dirname, filenames, filetypes)
                         VALUES (?1, ?2, ?3, ?4)",
                    )?),
                    changelog: None,
                }
            }
            DbKind::Other => {
                Self {
                    package: tx.prepare("INSERT INTO packages (pkgId) VALUES (?1)")?,
                    file: None,
                    dependencies: Vec::new(),
                    filelist: None,
                    changelog: Some(tx.prepare(
                        "INSERT INTO changelog (pkgKey, author, date, changelog)
                         VALUES (?1, ?2, ?3, ?4)",
                    )?),
                }
            }
        })
    }
}

/// Groups file paths by directory as the filelists database stores them.
fn group_by_dirname(pkg: &Package) -> Vec<(String, String, String)> {
    let mut groups: Vec<(String, Vec<&str>, String)> = Vec::new();
    for file in &pkg.files {
        let (dirname, basename) = match file.path.rsplit_once('/') {
            Some(("", base)) => ("/", base),
            Some((dir, base)) => (dir, base),
            None => ("", file.path.as_str()),
        };
        match groups.iter_mut().find(|(d, _, _)| d == dirname) {
            Some((_, names, types)) => {
                names.push(basename);
                types.push(file.type_code());
            }
            None => {
                groups.push((
                    dirname.to_string(),
                    vec![basename],
                    file.type_code().to_string(),
                ))
            }
        }
    }
    groups
        .into_iter()
        .map(|(dir, names, types)| (dir, names.join("/"), types))
        .collect()
}

pub struct MetadataDb {
    conn: Connection,
    kind: DbKind,
    path: PathBuf,
}

impl MetadataDb {
    /// Creates a fresh database at `path`, replacing any existing file.
    pub fn create<P: AsRef<Path>>(path: P, kind: DbKind) -> MetadataResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            fs::remove_file(path).io_context(|| format!("remove {}", path.display()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(kind.schema())?;
        Ok(Self {
            conn,
            kind,
            path: path.to_path_buf(),
        })
    }

    pub fn kind(&self) -> DbKind {
        self.kind
    }

    pub fn add_packages<'p, I>(&mut self, packages: I) -> MetadataResult<()>
    where
        I: IntoIterator<Item = &'p Package>,
    {
        let tx = self.conn.transaction()?;
        {
            let mut statements = DbStatements::new(&tx, self.kind)?;
            for pkg in packages {
                insert_package(&tx, &mut statements, self.kind, pkg)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Records the checksum of the XML file this database mirrors, builds
    /// indexes and closes the connection.
    pub fn finish(self, xml_checksum: &str) -> MetadataResult<PathBuf> {
        self.conn.execute(
            "INSERT INTO db_info (dbversion, checksum) VALUES (?1, ?2)",
            params![DB_VERSION, xml_checksum],
        )?;
        self.conn.execute_batch(self.kind.indexes())?;
        self.conn.close().map_err(|(_, err)| err)?;
        Ok(self.path)
    }
}

fn insert_package(
    tx: &Transaction,
    statements: &mut DbStatements,
    kind: DbKind,
    pkg: &Package,
) -> rusqlite::Result<()> {
    match kind {
        DbKind::Primary => {
            statements.package.execute(params![
                pkg.pkgid,
                pkg.name,
                pkg.arch,
                pkg.version,
                pkg.epoch,
                pkg.release,
                pkg.summary,
                pkg.description,
                pkg.url,
                pkg.time_file,
                pkg.time_build,
                pkg.license,
                pkg.vendor,
                pkg.group,
                pkg.buildhost,
                pkg.sourcerpm,
                pkg.header_start as i64,
                pkg.header_end as i64,
                pkg.packager,
                pkg.size_package as i64,
                pkg.size_installed as i64,
                pkg.size_archive as i64,
                pkg.location_href,
                pkg.location_base,
                pkg.checksum_type,
            ])?;
        }
        DbKind::Filelists | DbKind::Other => {
            statements.package.execute(params![pkg.pkgid])?;
        }
    }
    let pkg_key = tx.last_insert_rowid();

    if let Some(stmt) = statements.file.as_mut() {
        for file in pkg.primary_files() {
            let file_type = file.file_type.as_deref().unwrap_or("file");
            stmt.execute(params![file.path, file_type, pkg_key])?;
        }
    }

    let dependency_lists = [&pkg.provides, &pkg.requires, &pkg.conflicts, &pkg.obsoletes];
    for ((stmt, with_pre), deps) in statements.dependencies.iter_mut().zip(dependency_lists) {
        for dep in deps {
            if *with_pre {
                stmt.execute(params![
                    dep.name, dep.flags, dep.epoch, dep.version, dep.release, pkg_key, dep.pre
                ])?;
            } else {
                stmt.execute(params![
                    dep.name, dep.flags, dep.epoch, dep.version, dep.release, pkg_key
                ])?;
            }
        }
    }

    if let Some(stmt) = statements.filelist.as_mut() {
        for (dirname, filenames, filetypes) in group_by_dirname(pkg) {
            stmt.execute(params![pkg_key, dirname, filenames, filetypes])?;
        }
    }

    if let Some(stmt) = statements.changelog.as_mut() {
        for changelog in &pkg.changelogs {
            stmt.execute(params![pkg_key, changelog.author, changelog.date, changelog.text])?;
        }
    }

    Ok(())
}

/// Builds the compressed database companion of an XML record.
///
/// Returns the filled `<kind>_db` record; the uncompressed database is removed.
pub fn build_database<'p, I>(
    kind: DbKind,
    out_dir: &Path,
    packages: I,
    xml_record: &RepomdRecord,
    compression: CompressionType,
    checksum_type: ChecksumType,
) -> MetadataResult<RepomdRecord>
where
    I: IntoIterator<Item = &'p Package>,
{
    let db_path = out_dir.join(format!("{}.sqlite", kind.name()));
    debug!("generating database {}", db_path.display());

    let mut db = MetadataDb::create(&db_path, kind)?;
    db.add_packages(packages)?;
    let db_path = db.finish(&xml_record.checksum)?;

    let final_path = if compression == CompressionType::None {
        db_path
    } else {
        let compressed = out_dir.join(format!("{}.sqlite{}", kind.name(), compression.suffix()));
        compress_file(&db_path, &compressed, compression)?;
        fs::remove_file(&db_path).io_context(|| format!("remove {}", db_path.display()))?;
        compressed
    };

    let mut record = RepomdRecord::new(kind.record_kind(), &final_path);
    record.fill(checksum_type)?;
    record.database_version = Some(DB_VERSION);
    Ok(record)
}
