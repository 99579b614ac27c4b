mod load_tests;
