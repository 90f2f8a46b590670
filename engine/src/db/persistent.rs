//! Durable engine state: the per-partition progress cursor and the
//! seen-digest tail, in rocksdb.

use anyhow::{anyhow, bail, Context, Result};
use ck_contract::events::ContractModule;
use ck_primitives::{EpochSeconds, EventCursor, TxDigest};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, DB};
use std::{cmp::Ordering, collections::HashMap, fs, path::Path};
use tracing::{info, info_span};

/// Bump on any change to the persisted data format, and add a migration.
const LATEST_SCHEMA_VERSION: u32 = 0;

/// Key used to store the `LATEST_SCHEMA_VERSION` value in the `METADATA_COLUMN`
const DB_SCHEMA_VERSION_KEY: &[u8; 17] = b"db_schema_version";

/// A static length prefix is used on the `DATA_COLUMN`
const PREFIX_SIZE: usize = 10;
const CURSOR_PREFIX: &[u8; PREFIX_SIZE - MODULE_TAG_SIZE] = b"cursor__";
const DIGEST_PREFIX: &[u8; PREFIX_SIZE] = b"digest____";
const MODULE_TAG_SIZE: usize = 2;

/// Column family names
// All data is stored in `DATA_COLUMN` with a prefix for key spaces
const DATA_COLUMN: &str = "data";
// This column is just for schema version info. No prefix is used.
const METADATA_COLUMN: &str = "metadata";

/// Name of the directory that the backups will go into (only created before migrations)
const BACKUPS_DIRECTORY: &str = "backups";

fn module_tag(module: ContractModule) -> &'static [u8; MODULE_TAG_SIZE] {
	match module {
		ContractModule::WorkerRegistry => b"wr",
		ContractModule::RequestScheduler => b"rs",
	}
}

fn cursor_key(module: ContractModule) -> Vec<u8> {
	[&CURSOR_PREFIX[..], &module_tag(module)[..]].concat()
}

fn digest_key(digest: &TxDigest, intra_block: u32) -> Vec<u8> {
	[&DIGEST_PREFIX[..], &digest.0[..], &intra_block.to_be_bytes()[..]].concat()
}

pub struct PersistentStateDB {
	db: DB,
}

impl PersistentStateDB {
	/// Open the engine database, creating it if needed, and migrate it to
	/// the latest schema version.
	pub fn open_and_migrate_to_latest(db_path: &Path) -> Result<Self> {
		let span = info_span!("PersistentStateDB");
		let _entered = span.enter();

		Self::open_and_migrate_to_version(db_path, LATEST_SCHEMA_VERSION)
	}

	fn open_and_migrate_to_version(db_path: &Path, version: u32) -> Result<Self> {
		let is_existing_db = db_path.exists();

		// Use a prefix extractor on the data column
		let mut cfopts_for_prefix = Options::default();
		cfopts_for_prefix
			.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(PREFIX_SIZE));

		let cfs: HashMap<String, ColumnFamilyDescriptor> = HashMap::from_iter([
			(
				METADATA_COLUMN.to_string(),
				ColumnFamilyDescriptor::new(METADATA_COLUMN, Options::default()),
			),
			(DATA_COLUMN.to_string(), ColumnFamilyDescriptor::new(DATA_COLUMN, cfopts_for_prefix)),
		]);

		let mut create_missing_db_and_cols_opts = Options::default();
		create_missing_db_and_cols_opts.create_missing_column_families(true);
		create_missing_db_and_cols_opts.create_if_missing(true);

		let db =
			DB::open_cf_descriptors(&create_missing_db_and_cols_opts, db_path, cfs.into_values())
				.map_err(anyhow::Error::msg)
				.context(format!("Failed to open database at: {}", db_path.display()))?;

		// Only back up databases that existed before this open; a fresh db
		// has nothing worth preserving.
		let backup_option = if is_existing_db {
			BackupOption::CreateBackup(db_path)
		} else {
			let mut batch = WriteBatch::default();
			put_schema_version_to_batch(&db, &mut batch, LATEST_SCHEMA_VERSION);
			db.write(batch).context("Failed to write metadata to new db")?;
			BackupOption::NoBackup
		};

		migrate_db_to_version(&db, backup_option, version).with_context(|| {
			format!(
				"Failed to migrate database at {}. Manual restoration of a backup or purging of the file is required.",
				db_path.display()
			)
		})?;

		Ok(Self { db })
	}

	/// Atomically records that an event has been fully handled: the event
	/// key joins the seen tail and the partition cursor moves, in one
	/// batch. One transaction emits several events, so the seen key is
	/// (digest, intra-block index).
	pub fn commit_progress(
		&self,
		module: ContractModule,
		cursor: EventCursor,
		digest: TxDigest,
		intra_block: u32,
		seen_at: EpochSeconds,
	) -> Result<()> {
		let mut batch = WriteBatch::default();
		batch.put_cf(
			self.data_column(),
			cursor_key(module),
			bincode::serialize(&cursor).expect("cursor serializes"),
		);
		batch.put_cf(
			self.data_column(),
			digest_key(&digest, intra_block),
			bincode::serialize(&seen_at).expect("epoch serializes"),
		);
		self.db.write(batch).context("Failed to write progress batch")
	}

	pub fn load_cursor(&self, module: ContractModule) -> Result<Option<EventCursor>> {
		self.db
			.get_cf(self.data_column(), cursor_key(module))
			.context("Failed to read cursor")?
			.map(|bytes| {
				bincode::deserialize(&bytes)
					.map_err(|e| anyhow!("Deserialization failure: {}", e))
			})
			.transpose()
	}

	/// The persisted event-key tail, newest retention window only if
	/// pruning has been running.
	pub fn load_digests(&self) -> Result<Vec<((TxDigest, u32), EpochSeconds)>> {
		self.db
			.prefix_iterator_cf(self.data_column(), DIGEST_PREFIX)
			.map(|result| {
				let (key, value) = result.context("digest iteration failed")?;
				let digest_bytes: [u8; 32] = key[PREFIX_SIZE..PREFIX_SIZE + 32]
					.try_into()
					.map_err(|_| anyhow!("malformed digest key"))?;
				let index_bytes: [u8; 4] = key[PREFIX_SIZE + 32..]
					.try_into()
					.map_err(|_| anyhow!("malformed digest key"))?;
				let seen_at: EpochSeconds = bincode::deserialize(&value)
					.map_err(|e| anyhow!("Deserialization failure: {}", e))?;
				Ok(((TxDigest(digest_bytes), u32::from_be_bytes(index_bytes)), seen_at))
			})
			.collect()
	}

	/// Drops digests seen before `cutoff`. Returns how many were removed.
	pub fn prune_digests(&self, cutoff: EpochSeconds) -> Result<usize> {
		let stale: Vec<Vec<u8>> = self
			.db
			.prefix_iterator_cf(self.data_column(), DIGEST_PREFIX)
			.filter_map(|result| {
				let (key, value) = result.ok()?;
				let seen_at: EpochSeconds = bincode::deserialize(&value).ok()?;
				(seen_at < cutoff).then(|| key.to_vec())
			})
			.collect();

		let mut batch = WriteBatch::default();
		for key in &stale {
			batch.delete_cf(self.data_column(), key);
		}
		self.db.write(batch).context("Failed to prune digests")?;
		Ok(stale.len())
	}

	fn data_column(&self) -> &ColumnFamily {
		get_column_handle(&self.db, DATA_COLUMN)
	}
}

fn put_schema_version_to_batch(db: &DB, batch: &mut WriteBatch, version: u32) {
	batch.put_cf(
		get_column_handle(db, METADATA_COLUMN),
		DB_SCHEMA_VERSION_KEY,
		version.to_be_bytes(),
	);
}

fn read_schema_version(db: &DB) -> Result<u32> {
	db.get_cf(get_column_handle(db, METADATA_COLUMN), DB_SCHEMA_VERSION_KEY)
		.context("Failed to get metadata column")?
		.map(|version| {
			let version: [u8; 4] = version.try_into().expect("Version should be a u32");
			u32::from_be_bytes(version)
		})
		.ok_or_else(|| anyhow!("Could not find db schema version"))
}

fn get_column_handle<'a>(db: &'a DB, column_name: &str) -> &'a ColumnFamily {
	db.cf_handle(column_name)
		.unwrap_or_else(|| panic!("Should get column family handle for {column_name}"))
}

/// Used to specify whether a backup should be created, and if so,
/// the provided path is used to derive the name of the backup
enum BackupOption<'a> {
	NoBackup,
	CreateBackup(&'a Path),
}

fn migrate_db_to_version(
	db: &DB,
	backup_option: BackupOption,
	target_version: u32,
) -> Result<()> {
	let current_version =
		read_schema_version(db).context("Failed to read schema version from existing db")?;

	info!("Found db_schema_version of {current_version}");

	match current_version.cmp(&target_version) {
		Ordering::Equal => Ok(()),
		Ordering::Greater => {
			// We do not support backwards migrations
			Err(anyhow!(
				"Database schema version {} is ahead of the current schema version {}. Is your engine up to date?",
				current_version,
				target_version
			))
		},
		Ordering::Less => {
			if let BackupOption::CreateBackup(path) = backup_option {
				info!(
					"Database backup created at {}",
					create_backup(path, current_version)
						.context("Failed to create database backup before migration")?
				);
			}

			for version in current_version..target_version {
				info!("Database is migrating from version {version} to {}", version + 1);
				// No migrations exist yet; the first schema bump adds one.
				bail!("Unexpected migration from version {version}");
			}

			Ok(())
		},
	}
}

// Creates a backup of the database folder to BACKUPS_DIRECTORY/backup_vx_xx_xx
fn create_backup(path: &Path, schema_version: u32) -> Result<String> {
	let backup_dir_name = format!(
		"backup_v{}_{}_{}",
		schema_version,
		chrono::Utc::now().to_rfc3339(),
		&path
			.file_name()
			.expect("Should have file name")
			.to_os_string()
			.into_string()
			.expect("Should get string from filename"),
	);

	let backups_path = path.parent().expect("Should have parent").join(BACKUPS_DIRECTORY);
	if !backups_path.exists() {
		fs::create_dir_all(&backups_path).map_err(anyhow::Error::msg).with_context(|| {
			format!("Failed to create backup directory {}", backups_path.display())
		})?;
	}

	let backup_dir_path = backups_path.join(backup_dir_name);
	if backup_dir_path.exists() {
		bail!("Backup directory already exists {}", backup_dir_path.display());
	}

	let mut copy_options = fs_extra::dir::CopyOptions::new();
	copy_options.copy_inside = true;
	fs_extra::dir::copy(path, &backup_dir_path, &copy_options)
		.map_err(anyhow::Error::msg)
		.context("Failed to copy db files for backup")?;

	Ok(backup_dir_path
		.into_os_string()
		.into_string()
		.expect("Should get backup path as string"))
}

#[cfg(test)]
mod tests {
	use super::*;
	use utilities::testing::new_temp_directory_with_nonexistent_file;

	fn digest(byte: u8) -> TxDigest {
		TxDigest([byte; 32])
	}

	#[test]
	fn fresh_db_has_no_cursor() {
		let (_dir, db_file) = new_temp_directory_with_nonexistent_file();
		let db = PersistentStateDB::open_and_migrate_to_latest(&db_file).unwrap();
		assert!(db.load_cursor(ContractModule::WorkerRegistry).unwrap().is_none());
		assert!(db.load_digests().unwrap().is_empty());
	}

	#[test]
	fn progress_survives_reopen() {
		let (_dir, db_file) = new_temp_directory_with_nonexistent_file();
		{
			let db = PersistentStateDB::open_and_migrate_to_latest(&db_file).unwrap();
			db.commit_progress(
				ContractModule::WorkerRegistry,
				EventCursor::new(12, 3),
				digest(1),
				0,
				1000,
			)
			.unwrap();
			db.commit_progress(
				ContractModule::RequestScheduler,
				EventCursor::new(7, 0),
				digest(2),
				1,
				1001,
			)
			.unwrap();
		}

		let db = PersistentStateDB::open_and_migrate_to_latest(&db_file).unwrap();
		assert_eq!(
			db.load_cursor(ContractModule::WorkerRegistry).unwrap(),
			Some(EventCursor::new(12, 3))
		);
		assert_eq!(
			db.load_cursor(ContractModule::RequestScheduler).unwrap(),
			Some(EventCursor::new(7, 0))
		);

		let mut digests = db.load_digests().unwrap();
		digests.sort_by_key(|(_, seen_at)| *seen_at);
		assert_eq!(digests, vec![((digest(1), 0), 1000), ((digest(2), 1), 1001)]);
	}

	#[test]
	fn cursors_are_per_partition() {
		let (_dir, db_file) = new_temp_directory_with_nonexistent_file();
		let db = PersistentStateDB::open_and_migrate_to_latest(&db_file).unwrap();
		db.commit_progress(
			ContractModule::WorkerRegistry,
			EventCursor::new(5, 0),
			digest(1),
			0,
			1000,
		)
		.unwrap();
		assert!(db.load_cursor(ContractModule::RequestScheduler).unwrap().is_none());
	}

	#[test]
	fn pruning_drops_only_stale_digests() {
		let (_dir, db_file) = new_temp_directory_with_nonexistent_file();
		let db = PersistentStateDB::open_and_migrate_to_latest(&db_file).unwrap();
		for (byte, seen_at) in [(1u8, 100u64), (2, 200), (3, 300)] {
			db.commit_progress(
				ContractModule::WorkerRegistry,
				EventCursor::new(seen_at, 0),
				digest(byte),
				0,
				seen_at,
			)
			.unwrap();
		}

		assert_eq!(db.prune_digests(200).unwrap(), 1);
		let remaining: Vec<TxDigest> =
			db.load_digests().unwrap().into_iter().map(|((d, _), _)| d).collect();
		assert_eq!(remaining.len(), 2);
		assert!(!remaining.contains(&digest(1)));
	}
}
