pub(super) const ROOT_LONG_ABOUT: &str = "\
Protect directory trees against bit rot with recovery files

ParTree keeps erasure-coded recovery files for the directories you choose to protect.
When files later go missing or get damaged, the recovery files can tell you exactly
which ones, and can usually restore them.

The recovery data itself is computed by an external engine (par2j or a compatible
program), run once per protected directory.

CORE CONCEPTS:

  Protected directories:
    A protected directory owns one recovery file covering every file below it,
    subdirectories included. A directory inside a protected directory cannot be
    protected on its own.

  Recovery storage:
    Recovery files are kept in a hidden .partree directory at the top of the working
    directory. Its layout mirrors the protected tree, so the recovery file for
    photos/2020 is .partree/photos/2020/2020.par2.

  File states:
    Unknown     not covered by any recovery file
    Unverified  covered, not checked yet
    New         in a protected directory, but added after its recovery file
    Complete    checked and intact
    Missing     covered by a recovery file but gone
    Corrupt     present, but its contents no longer match

TYPICAL WORKFLOW:

  1. Protect the directories you care about:
     $ cd /data
     $ partree protect photos
     $ partree protect documents --redundancy 5

  2. Periodically verify them:
     $ partree verify

  3. If verify finds damage, repair it:
     $ partree repair photos

  4. After adding files, rebuild the recovery data:
     $ partree new-files
     $ partree recreate photos

GLOBAL OPTIONS:

  -C <DIRECTORY>
    Change to directory before operating (like git -C or make -C). The directory
    becomes the working directory that holds the recovery storage.

  --engine <PATH>
    Recovery engine to run. Overrides the engine named in the settings file;
    par2j is looked up on PATH when neither is given.

EXIT STATUS:

  0    success
  1    verification found missing or corrupt files, the engine reported a failure,
       or the operation was interrupted
  255  any other error

For detailed help on any command, use:
  partree <command> --help
";

pub(super) const PROTECT_LONG_ABOUT: &str = "\
Protect a directory with a recovery file

Marks the directory as protected and runs the recovery engine to create a recovery file
covering every file below it. Recovery files of directories below it are removed once
the new one exists, since they would be covered twice.

If the engine fails or the operation is interrupted with Ctrl-C, the directory is left
unprotected and any partial recovery data is removed.

The redundancy is the size of the recovery data relative to the protected data, in
percent. It decides how much damage can be repaired. The value given is remembered for
later runs.

EXAMPLES:

  # Protect with the remembered redundancy (10% by default)
  $ partree protect photos

  # Protect with 25% redundancy
  $ partree protect photos --redundancy 25
";

pub(super) const VERIFY_LONG_ABOUT: &str = "\
Verify protected directories against their recovery files

Runs the recovery engine for every protected directory at or below PATH and lists the
files that are missing or corrupt. Naming a directory inside a protected directory
verifies the whole protected directory: a recovery file can only be checked as a whole.

A protected directory that no longer exists is not passed to the engine. All of its
files are reported missing.

Exits with status 0 when every checked file is intact, and 1 otherwise. This makes the
command suitable for scheduled checks:

  $ partree -C /data verify || alert_admin
";
