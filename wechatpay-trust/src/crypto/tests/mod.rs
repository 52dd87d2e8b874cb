mod proptest_signatures;
